//! Metadata Model: classes, relationships, controlled terms and method
//! definitions as they are stored in the graph.

pub mod document;
pub mod schema;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use document::{EdgeRecord, MethodDocument, NodeRecord};
pub use schema::Schema;

/// Property read from data nodes as their representative value.
pub const VALUE_PROPERTY: &str = "rdfs:label";

/// Labels carried by metadata nodes.
pub mod labels {
    /// Entity type description.
    pub const CLASS: &str = "Class";
    /// Association between two classes.
    pub const RELATIONSHIP: &str = "Relationship";
    /// Controlled vocabulary value.
    pub const TERM: &str = "Term";
    /// Executable derivation step.
    pub const METHOD: &str = "Method";
}

/// Edge types used by metadata and method definitions.
pub mod edges {
    #![allow(missing_docs)]
    pub const NEXT: &str = "NEXT";
    pub const METHOD_ACTION: &str = "METHOD_ACTION";
    pub const SOURCE_CLASS: &str = "SOURCE_CLASS";
    pub const SOURCE_RELATIONSHIP: &str = "SOURCE_RELATIONSHIP";
    pub const ON: &str = "ON";
    pub const ON_VALUE: &str = "ON_VALUE";
    pub const FILTER_RELATIONSHIP: &str = "FILTER_RELATIONSHIP";
    pub const LINK: &str = "LINK";
    pub const FROM: &str = "FROM";
    pub const TO: &str = "TO";
    pub const FROM_VALUE: &str = "FROM_VALUE";
    pub const TO_VALUE: &str = "TO_VALUE";
    pub const CLASS: &str = "CLASS";
    pub const URI_FOR: &str = "URI_FOR";
    pub const URI_BY: &str = "URI_BY";
    pub const URI_LABEL: &str = "URI_LABEL";
    pub const METHOD_BRANCH: &str = "METHOD_BRANCH";
    pub const HAS_CONTROLLED_TERM: &str = "HAS_CONTROLLED_TERM";
    pub const SAME_AS: &str = "SAME_AS";
    pub const RESULT: &str = "RESULT";
    pub const DIMENSION: &str = "DIMENSION";
    pub const STATISTIC: &str = "STATISTIC";
    pub const FROM_CLASS: &str = "FROM_CLASS";
    pub const TO_CLASS: &str = "TO_CLASS";
    pub const SUBJECT_LEVEL: &str = "SUBJECT_LEVEL";
    pub const TERM: &str = "TERM";
}

/// Describes a real-world concept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassNode {
    /// Graph label used by data nodes of this class.
    pub label: String,
    /// Short tag used for query variables and column names.
    pub short_label: Option<String>,
    /// Declared value type (`str`, `int`, `float`, ...).
    pub data_type: Option<String>,
    /// True for classes produced by derivations.
    pub derived: bool,
}

impl ClassNode {
    /// Class with only a label.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            short_label: None,
            data_type: None,
            derived: false,
        }
    }

    /// Sets the short label.
    pub fn with_short_label(mut self, short: impl Into<String>) -> Self {
        self.short_label = Some(short.into());
        self
    }

    /// Sets the data type.
    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    /// Short label when present, else the label.
    pub fn tag(&self) -> &str {
        self.short_label.as_deref().unwrap_or(&self.label)
    }

    /// True for `int`/`float` data types.
    pub fn is_numeric(&self) -> bool {
        matches!(self.data_type.as_deref(), Some("int" | "float"))
    }
}

/// Metadata description of an association between two classes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipNode {
    /// Edge type used between data nodes; defaults to the `to` label.
    pub relationship_type: Option<String>,
    /// Human-readable name.
    pub label: Option<String>,
    /// Renames the `to` class's tag when present.
    pub short_label: Option<String>,
    /// Source class label.
    pub from: String,
    /// Target class label.
    pub to: String,
}

impl RelationshipNode {
    /// Relationship between two classes with the default type.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            relationship_type: None,
            label: None,
            short_label: None,
            from: from.into(),
            to: to.into(),
        }
    }

    /// Sets the relationship type.
    pub fn with_type(mut self, rel_type: impl Into<String>) -> Self {
        self.relationship_type = Some(rel_type.into());
        self
    }

    /// Type used for data edges.
    pub fn edge_type(&self) -> &str {
        self.relationship_type.as_deref().unwrap_or(&self.to)
    }
}

/// Controlled vocabulary value owned by a class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermNode {
    /// Optional submission code.
    pub code: Option<String>,
    /// Display value matched against data.
    pub label: String,
    /// Owning class label.
    pub class: String,
}

/// Kind of a Method node, read from its `type` property.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodType {
    /// Query the graph through the query builder.
    GetData,
    /// Constraint metadata for the preceding GetData.
    Filter,
    /// Local registered function.
    RunScript,
    /// Literal Cypher statement.
    RunCypher,
    /// Remote function.
    CallApi,
    /// Add a label to existing nodes.
    AssignClass,
    /// Create relationships between two classes' entities.
    Link,
    /// Merge statistic entities and link dimensions to them.
    LinkStat,
    /// Compute URI columns.
    BuildUri,
    /// Snapshot the context.
    BranchSave,
    /// Restore a snapshot.
    BranchLoad,
    /// Join snapshots into the context.
    BranchCombine,
    /// Statistics expansion.
    ApplyStat,
    /// Term remapping expansion.
    Decode,
    /// Subject-level parameter expansion.
    SubjectLevelLink,
}

impl MethodType {
    /// Every kind, in declaration order.
    pub const ALL: [MethodType; 15] = [
        MethodType::GetData,
        MethodType::Filter,
        MethodType::RunScript,
        MethodType::RunCypher,
        MethodType::CallApi,
        MethodType::AssignClass,
        MethodType::Link,
        MethodType::LinkStat,
        MethodType::BuildUri,
        MethodType::BranchSave,
        MethodType::BranchLoad,
        MethodType::BranchCombine,
        MethodType::ApplyStat,
        MethodType::Decode,
        MethodType::SubjectLevelLink,
    ];

    /// Name as written in method documents.
    pub fn as_str(self) -> &'static str {
        match self {
            MethodType::GetData => "get_data",
            MethodType::Filter => "filter",
            MethodType::RunScript => "run_script",
            MethodType::RunCypher => "run_cypher",
            MethodType::CallApi => "call_api",
            MethodType::AssignClass => "assign_class",
            MethodType::Link => "link",
            MethodType::LinkStat => "link_stat",
            MethodType::BuildUri => "build_uri",
            MethodType::BranchSave => "branch_save",
            MethodType::BranchLoad => "branch_load",
            MethodType::BranchCombine => "branch_combine",
            MethodType::ApplyStat => "apply_stat",
            MethodType::Decode => "decode",
            MethodType::SubjectLevelLink => "subject_level_link",
        }
    }

    /// Kinds replaced by a canned sequence at resolution time.
    pub fn is_super(self) -> bool {
        matches!(
            self,
            MethodType::ApplyStat | MethodType::Decode | MethodType::SubjectLevelLink
        )
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MethodType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MethodType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_owned())
    }
}
