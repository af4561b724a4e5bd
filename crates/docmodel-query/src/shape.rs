//! The result-shape state machine.
//!
//! Every query chain carries the shape its result would have if run right
//! now. Each verb is only legal from certain shapes, and moves the chain to
//! a new shape. [`transition`] is the single source of truth for that
//! relation; chain construction consults it and refuses verbs with no entry.

use crate::verb::Verb;

/// The type of value a chain produces at a given point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Shape {
    /// The root of the expression language, before any table is named.
    Root,
    /// A database handle.
    Db,
    /// A whole table.
    Table,
    /// A filtered subset of a table, still addressable for writes.
    Selection,
    /// Exactly one addressable row, as produced by `get`.
    SingleSelection,
    /// A lazy, unbounded sequence.
    Stream,
    /// A generic finite sequence.
    Sequence,
    /// A materialized array.
    Array,
    /// A plain document.
    Object,
    /// An opaque scalar.
    Value,
    Boolean,
    Number,
    String,
    Time,
    Binary,
    GroupedStream,
    GroupedData,
    /// A single element plucked out of a sequence (`min`, `max`).
    Element,
    /// Terms that only make sense as arguments to other terms.
    Special,
    Geometry,
    Line,
    Point,
    Polygon,
    /// The `error` term.
    Error,
}

impl Shape {
    pub fn name(self) -> &'static str {
        match self {
            Shape::Root => "r",
            Shape::Db => "db",
            Shape::Table => "table",
            Shape::Selection => "selection",
            Shape::SingleSelection => "singleSelection",
            Shape::Stream => "stream",
            Shape::Sequence => "sequence",
            Shape::Array => "array",
            Shape::Object => "object",
            Shape::Value => "value",
            Shape::Boolean => "boolean",
            Shape::Number => "number",
            Shape::String => "string",
            Shape::Time => "time",
            Shape::Binary => "binary",
            Shape::GroupedStream => "groupedStream",
            Shape::GroupedData => "groupedData",
            Shape::Element => "element",
            Shape::Special => "special",
            Shape::Geometry => "geometry",
            Shape::Line => "line",
            Shape::Point => "point",
            Shape::Polygon => "polygon",
            Shape::Error => "error",
        }
    }

    /// Shapes into which a filter may be spliced after the fact.
    pub fn is_filterable(self) -> bool {
        matches!(
            self,
            Shape::Table | Shape::Stream | Shape::Array | Shape::Selection
        )
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Look up the shape a verb produces from a given shape, or `None` when the
/// verb has no transition there (an illegal chain step).
#[allow(clippy::too_many_lines)]
pub fn transition(from: Shape, verb: Verb) -> Option<Shape> {
    use Shape::*;
    use Verb as V;

    let to = match (from, verb) {
        (Root, V::DbCreate | V::TableCreate | V::TableDrop | V::Grant | V::Wait | V::Info) => Object,
        (Root, V::DbDrop) => Object,
        (Root, V::DbList | V::TableList | V::Map | V::Union | V::Distinct) => Array,
        (Root, V::Db) => Db,
        (Root, V::Table) => Table,
        (Root, V::Group) => GroupedStream,
        (Root, V::Reduce | V::Row | V::Expr | V::Js | V::Json) => Value,
        (Root, V::Count | V::Sum | V::Avg | V::Random | V::Round | V::Ceil | V::Floor | V::Distance) => Number,
        (Root, V::Min | V::Max) => Element,
        (Root, V::Contains | V::And | V::Or | V::Intersects) => Boolean,
        (Root, V::Literal | V::Args) => Special,
        (Root, V::Now | V::Time | V::EpochTime | V::Iso8601) => Time,
        (Root, V::Binary) => Binary,
        (Root, V::Range | V::Http) => Stream,
        (Root, V::ErrorTerm) => Error,
        (Root, V::Uuid) => String,
        (Root, V::Circle | V::Geojson) => Geometry,
        (Root, V::Line) => Line,
        (Root, V::Point) => Point,

        (Db, V::TableCreate | V::TableDrop | V::Grant | V::Rebalance | V::Reconfigure | V::Wait) => Object,
        (Db, V::TableList) => Array,
        (Db, V::Table) => Table,
        (Db, V::Config) => Selection,

        (
            Table,
            V::IndexCreate
            | V::IndexDrop
            | V::IndexRename
            | V::Insert
            | V::Update
            | V::Replace
            | V::Delete
            | V::Sync
            | V::Grant
            | V::Rebalance
            | V::Reconfigure
            | V::Wait
            | V::Nth
            | V::ObjectTerm,
        ) => Object,
        (Table, V::IndexList | V::IndexWait | V::GetNearest) => Array,
        (Table, V::Get) => SingleSelection,
        (
            Table,
            V::GetAll | V::OrderBy | V::GetIntersecting | V::Config | V::Status | V::Filter | V::Slice,
        ) => Selection,
        (Table, V::Limit | V::Skip) => Selection,
        (Table, V::Between) => Sequence,
        (Table, V::Distinct | V::Map | V::Changes) => Stream,
        (Table, V::Pluck | V::Without | V::Merge) => Stream,
        (Table, V::Count) => Number,

        (Selection, V::Update | V::Replace | V::Delete) => Object,
        (
            Selection,
            V::Filter
            | V::Distinct
            | V::OrderBy
            | V::Slice
            | V::Nth
            | V::Map
            | V::Pluck
            | V::Limit
            | V::Skip,
        ) => Selection,
        (Selection, V::Count) => Number,
        (Selection, V::Changes) => Stream,

        (
            SingleSelection,
            V::Update | V::Replace | V::Delete | V::Do | V::Pluck | V::Without | V::Merge,
        ) => Object,
        (SingleSelection, V::GetField) => Value,
        (SingleSelection, V::Keys | V::Values) => Array,
        (SingleSelection, V::Changes) => Stream,

        (Stream, V::Filter | V::Zip | V::ConcatMap | V::Slice | V::Union | V::Map) => Stream,
        (Stream, V::Sample) => Array,

        (
            Array,
            V::Filter
            | V::InnerJoin
            | V::OuterJoin
            | V::Zip
            | V::Map
            | V::WithFields
            | V::ConcatMap
            | V::Skip
            | V::Limit
            | V::Slice
            | V::Union
            | V::Sample
            | V::Pluck
            | V::Without
            | V::Merge
            | V::Append
            | V::Prepend
            | V::Difference
            | V::SetInsert
            | V::SetUnion
            | V::SetIntersection
            | V::SetDifference
            | V::HasFields
            | V::InsertAt
            | V::SpliceAt
            | V::DeleteAt
            | V::ChangeAt
            | V::Mul,
        ) => Array,

        (
            Sequence,
            V::InnerJoin
            | V::OuterJoin
            | V::Map
            | V::WithFields
            | V::Skip
            | V::Limit
            | V::Pluck
            | V::Without
            | V::Merge
            | V::HasFields,
        ) => Stream,
        (Sequence, V::EqJoin | V::Fold | V::GetField | V::Includes | V::Intersects) => Sequence,
        (Sequence, V::OrderBy | V::OffsetsOf | V::Distinct) => Array,
        (Sequence, V::Nth | V::ForEach) => Object,
        (Sequence, V::IsEmpty | V::Contains) => Boolean,
        (Sequence, V::Sample) => Selection,
        (Sequence, V::Group) => GroupedStream,
        (Sequence, V::Reduce) => Value,
        (Sequence, V::Count | V::Sum | V::Avg) => Number,
        (Sequence, V::Min | V::Max) => Element,

        (Binary, V::Slice) => Binary,
        (Binary, V::Count) => Number,

        (String, V::Slice | V::Upcase | V::Downcase) => String,
        (String, V::Count) => Number,
        (String, V::Match) => Object,
        (String, V::Split) => Array,

        (GroupedStream | GroupedData, V::Ungroup) => Array,

        (Object, V::Count) => Number,
        (Object, V::Pluck | V::Do | V::Without | V::Merge) => Object,
        (Object, V::GetField) => Value,
        (Object, V::HasFields) => Boolean,
        (Object, V::Keys | V::Values) => Array,

        (Value, V::Add) => Value,
        (Value, V::Eq | V::Ne | V::Gt | V::Ge | V::Lt | V::Le) => Boolean,
        (Value, V::ToJsonString | V::ToJson) => String,

        (Time, V::Add | V::Sub | V::InTimezone | V::Time) => Time,
        (Time, V::Timezone | V::ToIso8601) => String,
        (Time, V::During) => Boolean,
        (
            Time,
            V::TimeOfDay
            | V::Year
            | V::Month
            | V::Day
            | V::DayOfWeek
            | V::DayOfYear
            | V::Hours
            | V::Minutes
            | V::Seconds
            | V::ToEpochTime,
        ) => Number,

        (Number, V::Sub | V::Mul | V::Div | V::Mod | V::Round | V::Ceil | V::Floor) => Number,

        (Boolean, V::And | V::Or | V::Not) => Boolean,

        (Geometry, V::Distance) => Number,
        (Geometry, V::ToGeojson) => Object,
        (Geometry, V::Includes | V::Intersects) => Boolean,

        (Line, V::Fill) => Polygon,
        (Point, V::Point) => Point,
        (Polygon, V::Polygon | V::PolygonSub) => Polygon,

        _ => return None,
    };
    Some(to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_chain_shapes() {
        assert_eq!(transition(Shape::Root, Verb::Table), Some(Shape::Table));
        assert_eq!(transition(Shape::Table, Verb::Filter), Some(Shape::Selection));
        assert_eq!(transition(Shape::Table, Verb::Get), Some(Shape::SingleSelection));
        assert_eq!(transition(Shape::Selection, Verb::Pluck), Some(Shape::Selection));
        assert_eq!(transition(Shape::SingleSelection, Verb::Do), Some(Shape::Object));
    }

    #[test]
    fn projections_apply_directly_to_a_table() {
        assert_eq!(transition(Shape::Table, Verb::Pluck), Some(Shape::Stream));
        assert_eq!(transition(Shape::Table, Verb::Without), Some(Shape::Stream));
        assert_eq!(transition(Shape::Table, Verb::Merge), Some(Shape::Stream));
    }

    #[test]
    fn writes_collapse_to_object() {
        for from in [Shape::Table, Shape::Selection, Shape::SingleSelection] {
            assert_eq!(transition(from, Verb::Update), Some(Shape::Object));
            assert_eq!(transition(from, Verb::Delete), Some(Shape::Object));
        }
        assert_eq!(transition(Shape::Table, Verb::Insert), Some(Shape::Object));
    }

    #[test]
    fn changes_produces_a_stream() {
        assert_eq!(transition(Shape::Table, Verb::Changes), Some(Shape::Stream));
        assert_eq!(transition(Shape::Selection, Verb::Changes), Some(Shape::Stream));
        assert_eq!(
            transition(Shape::SingleSelection, Verb::Changes),
            Some(Shape::Stream)
        );
    }

    #[test]
    fn illegal_steps_have_no_transition() {
        assert_eq!(transition(Shape::Object, Verb::Filter), None);
        assert_eq!(transition(Shape::Number, Verb::Get), None);
        assert_eq!(transition(Shape::Table, Verb::Fill), None);
        assert_eq!(transition(Shape::Stream, Verb::Insert), None);
    }

    #[test]
    fn filterable_shapes() {
        assert!(Shape::Table.is_filterable());
        assert!(Shape::Selection.is_filterable());
        assert!(Shape::Stream.is_filterable());
        assert!(Shape::Array.is_filterable());
        assert!(!Shape::Object.is_filterable());
        assert!(!Shape::SingleSelection.is_filterable());
    }
}
