//! The closed vocabulary of query verbs.
//!
//! Every method a chain can take is one of these variants. The wire name
//! (camelCase, as the protocol spells it) is carried by [`Verb::name`].

macro_rules! verbs {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// A single query operation by name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum Verb {
            $($variant,)+
        }

        impl Verb {
            /// Protocol-level spelling of the verb.
            pub fn name(self) -> &'static str {
                match self {
                    $(Verb::$variant => $name,)+
                }
            }
        }
    };
}

verbs! {
    Add => "add",
    And => "and",
    Append => "append",
    Args => "args",
    Avg => "avg",
    Between => "between",
    Binary => "binary",
    Ceil => "ceil",
    ChangeAt => "changeAt",
    Changes => "changes",
    Circle => "circle",
    CoerceTo => "coerceTo",
    ConcatMap => "concatMap",
    Config => "config",
    Contains => "contains",
    Count => "count",
    Day => "day",
    DayOfWeek => "dayOfWeek",
    DayOfYear => "dayOfYear",
    Db => "db",
    DbCreate => "dbCreate",
    DbDrop => "dbDrop",
    DbList => "dbList",
    Default => "default",
    Delete => "delete",
    DeleteAt => "deleteAt",
    Difference => "difference",
    Distance => "distance",
    Distinct => "distinct",
    Div => "div",
    Do => "do",
    Downcase => "downcase",
    During => "during",
    EpochTime => "epochTime",
    Eq => "eq",
    EqJoin => "eqJoin",
    ErrorTerm => "error",
    Expr => "expr",
    Fill => "fill",
    Filter => "filter",
    Floor => "floor",
    Fold => "fold",
    ForEach => "forEach",
    Ge => "ge",
    Geojson => "geojson",
    Get => "get",
    GetAll => "getAll",
    GetField => "getField",
    GetIntersecting => "getIntersecting",
    GetNearest => "getNearest",
    Grant => "grant",
    Group => "group",
    Gt => "gt",
    HasFields => "hasFields",
    Hours => "hours",
    Http => "http",
    InTimezone => "inTimezone",
    Includes => "includes",
    IndexCreate => "indexCreate",
    IndexDrop => "indexDrop",
    IndexList => "indexList",
    IndexRename => "indexRename",
    IndexWait => "indexWait",
    Info => "info",
    InnerJoin => "innerJoin",
    Insert => "insert",
    InsertAt => "insertAt",
    Intersects => "intersects",
    IsEmpty => "isEmpty",
    Iso8601 => "ISO8601",
    Js => "js",
    Json => "json",
    Keys => "keys",
    Le => "le",
    Limit => "limit",
    Line => "line",
    Literal => "literal",
    Lt => "lt",
    Map => "map",
    Match => "match",
    Max => "max",
    Merge => "merge",
    Min => "min",
    Minutes => "minutes",
    Mod => "mod",
    Month => "month",
    Mul => "mul",
    Ne => "ne",
    Not => "not",
    Now => "now",
    Nth => "nth",
    ObjectTerm => "object",
    OffsetsOf => "offsetsOf",
    Or => "or",
    OrderBy => "orderBy",
    OuterJoin => "outerJoin",
    Pluck => "pluck",
    Point => "point",
    Polygon => "polygon",
    PolygonSub => "polygonSub",
    Prepend => "prepend",
    Random => "random",
    Range => "range",
    Rebalance => "rebalance",
    Reconfigure => "reconfigure",
    Reduce => "reduce",
    Replace => "replace",
    Round => "round",
    Row => "row",
    Sample => "sample",
    Seconds => "seconds",
    SetDifference => "setDifference",
    SetInsert => "setInsert",
    SetIntersection => "setIntersection",
    SetUnion => "setUnion",
    Skip => "skip",
    Slice => "slice",
    SpliceAt => "spliceAt",
    Split => "split",
    Status => "status",
    Sub => "sub",
    Sum => "sum",
    Sync => "sync",
    Table => "table",
    TableCreate => "tableCreate",
    TableDrop => "tableDrop",
    TableList => "tableList",
    Time => "time",
    TimeOfDay => "timeOfDay",
    Timezone => "timezone",
    ToEpochTime => "toEpochTime",
    ToGeojson => "toGeojson",
    ToIso8601 => "toISO8601",
    ToJson => "toJSON",
    ToJsonString => "toJsonString",
    Ungroup => "ungroup",
    Union => "union",
    Upcase => "upcase",
    Update => "update",
    Uuid => "uuid",
    Values => "values",
    Wait => "wait",
    WithFields => "withFields",
    Without => "without",
    Year => "year",
    Zip => "zip",
}

impl Verb {
    /// Verbs after which a late filter insertion is refused. These either
    /// mutate data or manage schema, so splicing a predicate into such a
    /// chain would change what the statement does.
    pub fn rejects_late_filter(self) -> bool {
        matches!(
            self,
            Verb::IndexCreate
                | Verb::IndexDrop
                | Verb::IndexList
                | Verb::IndexRename
                | Verb::IndexWait
                | Verb::Insert
                | Verb::Grant
                | Verb::Config
                | Verb::Rebalance
                | Verb::Reconfigure
                | Verb::Status
                | Verb::Wait
                | Verb::TableCreate
        )
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
