//! End-to-end relation tests against the in-memory driver: key synthesis,
//! recursive saves, join tables, and populate.

use std::future::Future;

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use serde_json::json;

use docmodel::{
    Database, Error, ModelDef, PopulateSpec, PropertyDef, PropertyKind, RelationDecl,
};
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

fn named(model: &str) -> ModelDef {
    ModelDef::new(model).property(PropertyDef::new("name", PropertyKind::String))
}

async fn game_db(cx: &Cx) -> Database {
    let db = Database::new(MemoryDriver::new());
    db.register(
        named("Character")
            .relation(RelationDecl::has_one("equippedWeapon", "Weapon"))
            .relation(RelationDecl::has_many("spells", "Spell")),
    )
    .unwrap();
    db.register(named("Weapon")).unwrap();
    db.register(named("Spell")).unwrap();
    unwrap_outcome(db.connect(cx).await);
    db
}

#[test]
fn saving_assigns_the_has_one_key() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = game_db(&cx).await;

        let character = db.create("Character").unwrap();
        character.set("name", json!("Aria")).unwrap();
        let weapon = db.create("Weapon").unwrap();
        weapon.set("name", json!("Longbow")).unwrap();
        character.set_relation("equippedWeapon", &weapon).unwrap();

        unwrap_outcome(character.save(&cx).await);

        let weapon_id = weapon.id().expect("weapon saved alongside its owner");
        assert_eq!(character.get("equippedWeaponId"), Some(json!(weapon_id)));

        let stored = unwrap_outcome(
            db.query("Character")
                .unwrap()
                .get(character.id().unwrap())
                .unwrap()
                .run_one(&cx)
                .await,
        )
        .expect("character row exists");
        assert_eq!(stored.get("equippedWeaponId"), Some(json!(weapon_id)));
    });
}

#[test]
fn has_many_children_point_back_at_their_parent() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = game_db(&cx).await;

        let character = db.create("Character").unwrap();
        character.set("name", json!("Aria")).unwrap();
        for name in ["Fireball", "Blink"] {
            let spell = db.create("Spell").unwrap();
            spell.set("name", json!(name)).unwrap();
            character.add_relation("spells", &spell).unwrap();
        }
        unwrap_outcome(character.save(&cx).await);

        let parent_id = character.id().unwrap();
        let spells = unwrap_outcome(
            db.query("Spell")
                .unwrap()
                .filter(json!({"characterId": parent_id}))
                .unwrap()
                .run_many(&cx)
                .await,
        );
        assert_eq!(spells.len(), 2);

        // A fresh handle populates the collection by index lookup.
        let reloaded = unwrap_outcome(
            db.query("Character")
                .unwrap()
                .get(parent_id)
                .unwrap()
                .run_one(&cx)
                .await,
        )
        .unwrap();
        unwrap_outcome(reloaded.populate(&cx, &PopulateSpec::only(&["spells"])).await);
        let mut names: Vec<String> = reloaded
            .relation_list("spells")
            .iter()
            .filter_map(|s| s.get("name"))
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        names.sort();
        assert_eq!(names, ["Blink", "Fireball"]);
    });
}

#[test]
fn belongs_to_saves_its_target_first() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = Database::new(MemoryDriver::new());
        db.register(named("Post").relation(RelationDecl::belongs_to("author", "User")))
            .unwrap();
        db.register(named("User")).unwrap();
        unwrap_outcome(db.connect(&cx).await);

        let post = db.create("Post").unwrap();
        post.set("name", json!("Hello")).unwrap();
        let author = db.create("User").unwrap();
        author.set("name", json!("ada")).unwrap();
        post.set_relation("author", &author).unwrap();

        unwrap_outcome(post.save(&cx).await);

        let author_id = author.id().expect("author saved before the post");
        assert_eq!(post.get("userAuthorId"), Some(json!(author_id)));
    });
}

#[test]
fn mutual_has_one_saves_without_looping() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = Database::new(MemoryDriver::new());
        db.register(named("Alpha").relation(RelationDecl::has_one("beta", "Beta")))
            .unwrap();
        db.register(named("Beta").relation(RelationDecl::has_one("alpha", "Alpha")))
            .unwrap();
        unwrap_outcome(db.connect(&cx).await);

        let a = db.create("Alpha").unwrap();
        a.set("name", json!("a")).unwrap();
        let b = db.create("Beta").unwrap();
        b.set("name", json!("b")).unwrap();
        a.set_relation("beta", &b).unwrap();
        b.set_relation("alpha", &a).unwrap();

        unwrap_outcome(a.save(&cx).await);

        let a_id = a.id().unwrap();
        let b_id = b.id().unwrap();
        assert_eq!(a.get("betaId"), Some(json!(b_id)));
        assert_eq!(b.get("alphaId"), Some(json!(a_id)));

        // Both key writes reached the store, not just the handles.
        let stored_b = unwrap_outcome(
            db.query("Beta").unwrap().get(b_id).unwrap().run_one(&cx).await,
        )
        .unwrap();
        assert_eq!(stored_b.get("alphaId"), Some(json!(a_id)));
    });
}

#[test]
fn many_to_many_links_are_visible_from_both_sides() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = Database::new(MemoryDriver::new());
        db.register(named("Post").relation(RelationDecl::has_many("tags", "Tag")))
            .unwrap();
        db.register(named("Tag").relation(RelationDecl::has_many("posts", "Post")))
            .unwrap();
        unwrap_outcome(db.connect(&cx).await);

        let post = db.create("Post").unwrap();
        post.set("name", json!("intro")).unwrap();
        let tag = db.create("Tag").unwrap();
        tag.set("name", json!("rust")).unwrap();
        post.add_relation("tags", &tag).unwrap();
        unwrap_outcome(post.save(&cx).await);

        // Linking the same pair from the other side is a no-op, not an error.
        tag.add_relation("posts", &post).unwrap();
        unwrap_outcome(tag.save(&cx).await);

        let from_tag = unwrap_outcome(
            db.query("Tag")
                .unwrap()
                .get(tag.id().unwrap())
                .unwrap()
                .populate(PopulateSpec::only(&["posts"]))
                .run_one(&cx)
                .await,
        )
        .unwrap();
        let posts = from_tag.relation_list("posts");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].get("name"), Some(json!("intro")));

        let from_post = unwrap_outcome(
            db.query("Post")
                .unwrap()
                .get(post.id().unwrap())
                .unwrap()
                .populate(PopulateSpec::only(&["tags"]))
                .run_one(&cx)
                .await,
        )
        .unwrap();
        assert_eq!(from_post.relation_list("tags").len(), 1);
    });
}

#[test]
fn a_three_model_cycle_saves_and_links_every_key() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = Database::new(MemoryDriver::new());
        db.register(named("Alpha").relation(RelationDecl::has_one("beta", "Beta")))
            .unwrap();
        db.register(named("Beta").relation(RelationDecl::has_one("gamma", "Gamma")))
            .unwrap();
        db.register(named("Gamma").relation(RelationDecl::has_one("alpha", "Alpha")))
            .unwrap();
        unwrap_outcome(db.connect(&cx).await);

        let a = db.create("Alpha").unwrap();
        a.set("name", json!("a")).unwrap();
        let b = db.create("Beta").unwrap();
        b.set("name", json!("b")).unwrap();
        let c = db.create("Gamma").unwrap();
        c.set("name", json!("c")).unwrap();
        a.set_relation("beta", &b).unwrap();
        b.set_relation("gamma", &c).unwrap();
        c.set_relation("alpha", &a).unwrap();

        unwrap_outcome(a.save(&cx).await);

        assert_eq!(a.get("betaId"), Some(json!(b.id().unwrap())));
        assert_eq!(b.get("gammaId"), Some(json!(c.id().unwrap())));
        // The edge closing the cycle is deferred and flushed by the root
        // save once every row has an id.
        assert_eq!(c.get("alphaId"), Some(json!(a.id().unwrap())));

        let stored_c = unwrap_outcome(
            db.query("Gamma")
                .unwrap()
                .get(c.id().unwrap())
                .unwrap()
                .run_one(&cx)
                .await,
        )
        .unwrap();
        assert_eq!(stored_c.get("alphaId"), Some(json!(a.id().unwrap())));

        // Expanding the full graph ties the far end back to the root handle.
        let root = unwrap_outcome(
            db.query("Alpha")
                .unwrap()
                .get(a.id().unwrap())
                .unwrap()
                .run_one(&cx)
                .await,
        )
        .unwrap();
        unwrap_outcome(root.populate(&cx, &PopulateSpec::All).await);
        let far = root
            .relation_instance("beta")
            .and_then(|beta| beta.relation_instance("gamma"))
            .and_then(|gamma| gamma.relation_instance("alpha"))
            .expect("cycle expanded through all three models");
        assert_eq!(far.id(), root.id());
    });
}

#[test]
fn populate_all_ties_a_cycle_back_to_the_root_handle() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = Database::new(MemoryDriver::new());
        db.register(named("Alpha").relation(RelationDecl::has_one("beta", "Beta")))
            .unwrap();
        db.register(named("Beta").relation(RelationDecl::has_one("alpha", "Alpha")))
            .unwrap();
        unwrap_outcome(db.connect(&cx).await);

        let a = db.create("Alpha").unwrap();
        a.set("name", json!("a")).unwrap();
        let b = db.create("Beta").unwrap();
        b.set("name", json!("b")).unwrap();
        a.set_relation("beta", &b).unwrap();
        b.set_relation("alpha", &a).unwrap();
        unwrap_outcome(a.save(&cx).await);

        let root = unwrap_outcome(
            db.query("Alpha")
                .unwrap()
                .get(a.id().unwrap())
                .unwrap()
                .run_one(&cx)
                .await,
        )
        .unwrap();
        unwrap_outcome(root.populate(&cx, &PopulateSpec::All).await);

        let beta = root.relation_instance("beta").expect("beta expanded");
        let back = beta.relation_instance("alpha").expect("cycle expanded one level");
        assert_eq!(back.id(), root.id());

        // Serialization skips the edge pointing back up the path.
        let encoded = root.to_value().unwrap();
        assert_eq!(encoded["beta"]["name"], json!("b"));
        assert!(encoded["beta"].get("alpha").is_none());
    });
}

#[test]
fn populate_requires_a_persisted_instance() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = game_db(&cx).await;
        let character = db.create("Character").unwrap();
        let outcome = character.populate(&cx, &PopulateSpec::All).await;
        match outcome {
            Outcome::Err(Error::NotPersisted { operation, .. }) => {
                assert_eq!(operation, "populate");
            }
            other => panic!("expected a not-persisted error, got {other:?}"),
        }
    });
}

#[test]
fn relation_targets_are_model_checked() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = game_db(&cx).await;
        let character = db.create("Character").unwrap();
        let spell = db.create("Spell").unwrap();
        assert!(matches!(
            character.set_relation("equippedWeapon", &spell),
            Err(Error::Relation(_))
        ));
        let weapon = db.create("Weapon").unwrap();
        assert!(matches!(
            character.add_relation("equippedWeapon", &weapon),
            Err(Error::Relation(_))
        ));
    });
}

#[test]
fn unregistered_models_and_late_registration_are_rejected() {
    let cx = Cx::for_testing();
    block_on(async {
        let db = game_db(&cx).await;
        assert!(db.query("Ghost").is_err());
        assert!(db.register(named("Late")).is_err());
    });
}
