//! Live change feed tests: hydration of both sides, minimal diffs, and
//! selection-scoped subscriptions.

use std::future::Future;

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use serde_json::json;

use docmodel::{Database, ModelDef, PropertyDef, PropertyKind};
use docmodel_memory::MemoryDriver;

fn unwrap_outcome<T, E: std::fmt::Debug>(outcome: Outcome<T, E>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e:?}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

async fn user_db(cx: &Cx) -> Database {
    let db = Database::new(MemoryDriver::new());
    db.register(
        ModelDef::new("User")
            .property(PropertyDef::new("name", PropertyKind::String))
            .property(PropertyDef::new("age", PropertyKind::Number).allow_null(true)),
    )
    .unwrap();
    unwrap_outcome(db.connect(cx).await);
    db
}

#[test]
fn a_table_feed_sees_inserts_and_updates() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = user_db(&cx).await;
        let mut feed = unwrap_outcome(
            db.query("User").unwrap().changes().unwrap().run_feed(&cx).await,
        );

        let user = db.create("User").unwrap();
        user.set("name", json!("ada")).unwrap();
        user.set("age", json!(36)).unwrap();
        unwrap_outcome(user.save(&cx).await);

        let insert = unwrap_outcome(feed.next(&cx).await).expect("insert event");
        assert!(insert.old.is_none());
        let inserted = insert.new.as_ref().expect("new side hydrated");
        assert_eq!(inserted.get("name"), Some(json!("ada")));
        assert_eq!(inserted.id(), user.id());
        // An insert's diff is the whole new document.
        assert_eq!(insert.diff()["name"], json!("ada"));

        user.set("age", json!(37)).unwrap();
        unwrap_outcome(user.save(&cx).await);

        let update = unwrap_outcome(feed.next(&cx).await).expect("update event");
        assert!(update.old.is_some());
        // An update's diff is the id plus exactly the changed columns.
        assert_eq!(
            update.diff(),
            json!({"id": user.id().unwrap(), "age": 37})
        );

        assert!(unwrap_outcome(feed.next(&cx).await).is_none());
    });
}

#[test]
fn a_delete_event_carries_only_the_old_side() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = user_db(&cx).await;
        let user = db.create("User").unwrap();
        user.set("name", json!("grace")).unwrap();
        unwrap_outcome(user.save(&cx).await);

        let mut feed = unwrap_outcome(
            db.query("User").unwrap().changes().unwrap().run_feed(&cx).await,
        );
        unwrap_outcome(user.delete(&cx).await);

        let event = unwrap_outcome(feed.next(&cx).await).expect("delete event");
        assert!(event.new.is_none());
        assert_eq!(
            event.old.as_ref().and_then(|o| o.get("name")),
            Some(json!("grace"))
        );
        // A delete's diff is the old document.
        assert_eq!(event.diff()["name"], json!("grace"));
    });
}

#[test]
fn a_single_selection_feed_ignores_other_rows() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = user_db(&cx).await;
        let watched = db.create("User").unwrap();
        watched.set("name", json!("ada")).unwrap();
        unwrap_outcome(watched.save(&cx).await);
        let other = db.create("User").unwrap();
        other.set("name", json!("grace")).unwrap();
        unwrap_outcome(other.save(&cx).await);

        let mut feed = unwrap_outcome(
            db.query("User")
                .unwrap()
                .get(watched.id().unwrap())
                .unwrap()
                .changes()
                .unwrap()
                .run_feed(&cx)
                .await,
        );

        other.set("name", json!("hopper")).unwrap();
        unwrap_outcome(other.save(&cx).await);
        assert!(unwrap_outcome(feed.next(&cx).await).is_none());

        watched.set("name", json!("lovelace")).unwrap();
        unwrap_outcome(watched.save(&cx).await);
        let event = unwrap_outcome(feed.next(&cx).await).expect("watched row event");
        assert_eq!(
            event.new.as_ref().and_then(|n| n.get("name")),
            Some(json!("lovelace"))
        );
    });
}

#[test]
fn a_closed_feed_yields_nothing() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = user_db(&cx).await;
        let mut feed = unwrap_outcome(
            db.query("User").unwrap().changes().unwrap().run_feed(&cx).await,
        );
        feed.close();

        let user = db.create("User").unwrap();
        user.set("name", json!("ada")).unwrap();
        unwrap_outcome(user.save(&cx).await);

        assert!(unwrap_outcome(feed.next(&cx).await).is_none());
    });
}
