//! SuperMethod expansion.
//!
//! ApplyStat, Decode and SubjectLevelLink nodes never execute themselves.
//! At resolution time each one is replaced by a fixed sequence of primitive
//! actions built from its metadata. Generated ids are `{id}_<step>` with a
//! numeric suffix per dimension combination, so two resolutions of the same
//! document produce the same ids.

use serde_json::{json, Value as JsonValue};

use super::resolve::Step;
use crate::actions::{
    Action, AssignLabel, BranchCombine, BranchLoad, BranchSave, BuildUri, CallApi, ClassRef,
    Endpoint, Link, LinkStat, Metadata, RunScript,
};
use crate::error::ResolutionError;
use crate::model::schema::class_from_record;
use crate::model::{edges, ClassNode, MethodType, NodeRecord, VALUE_PROPERTY};
use crate::query::{id_column, uri_column};
use crate::scripts::{ScriptCall, ScriptParams, BUILTIN_PACKAGE};

type Expanded = Result<Vec<Step>, ResolutionError>;

/// Percentage statistic produced next to counts.
pub const PERCENT_CLASS: &str = "Number of observations (Percent)";
/// Column tag of [`PERCENT_CLASS`].
pub const PERCENT_TAG: &str = "npct";

const COUNT_STATS: [&str; 2] = ["n", "n_distinct"];

/// Steps generated for a SuperMethod node.
pub fn expand(kind: MethodType, meta: &Metadata<'_>, node: &NodeRecord) -> Expanded {
    match kind {
        MethodType::ApplyStat => apply_stat(meta, node),
        MethodType::Decode => decode(meta, node),
        MethodType::SubjectLevelLink => subject_level_link(meta, node),
        other => Err(ResolutionError::Placement {
            id: node.id.clone(),
            reason: format!("'{other}' is not a super method"),
        }),
    }
}

fn params(value: JsonValue) -> ScriptParams {
    match value {
        JsonValue::Object(map) => map,
        _ => ScriptParams::new(),
    }
}

fn builtin(script: &str, value: JsonValue) -> Action {
    Action::RunScript(RunScript {
        call: ScriptCall::new(BUILTIN_PACKAGE, script, params(value)),
    })
}

/// CallAPI step inheriting the super node's repository coordinates.
fn remote(node: &NodeRecord, package: &str, script: &str, value: JsonValue) -> Action {
    let mut call = ScriptCall::new(package, script, params(value));
    call.repo = node.prop_str("repo").map(str::to_owned);
    call.branch = node.prop_str("branch").map(str::to_owned);
    call.path = node.prop_str("path").map(str::to_owned);
    Action::CallApi(CallApi { call })
}

fn link(from: Endpoint, to: Endpoint, edge_type: impl Into<String>) -> Action {
    Action::Link(Link {
        from,
        to,
        edge_type: edge_type.into(),
    })
}

#[derive(Clone, Debug)]
struct Dimension {
    class: ClassNode,
    tag: String,
    required: bool,
    denominator: bool,
    all_ct: bool,
}

/// Required dimensions plus every subset of the optional ones, smallest
/// subsets first and in declaration order within a size.
fn combinations(dims: &[Dimension]) -> Vec<Vec<&Dimension>> {
    let required: Vec<&Dimension> = dims.iter().filter(|d| d.required).collect();
    let optional: Vec<&Dimension> = dims.iter().filter(|d| !d.required).collect();
    let mut subsets: Vec<Vec<usize>> = Vec::new();
    for size in 0..=optional.len() {
        let mut current = Vec::with_capacity(size);
        choose(optional.len(), size, 0, &mut current, &mut subsets);
    }
    subsets
        .into_iter()
        .map(|subset| {
            let mut combo = required.clone();
            combo.extend(subset.into_iter().map(|i| optional[i]));
            // keep declaration order inside a combination
            combo.sort_by_key(|d| dims.iter().position(|x| x.tag == d.tag));
            combo
        })
        .collect()
}

fn choose(n: usize, size: usize, start: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
    if current.len() == size {
        out.push(current.clone());
        return;
    }
    for i in start..n {
        current.push(i);
        choose(n, size, i + 1, current, out);
        current.pop();
    }
}

fn summarise_by(dims: &[&Dimension]) -> Vec<String> {
    dims.iter()
        .flat_map(|d| [id_column(&d.tag), d.tag.clone()])
        .collect()
}

fn apply_stat(meta: &Metadata<'_>, node: &NodeRecord) -> Expanded {
    let id = node.id.as_str();
    let results = meta.classes(node, edges::RESULT);
    let result = match results.as_slice() {
        [only] => meta.tags.class_ref(only),
        [] => return Err(ResolutionError::missing(id, "RESULT class")),
        _ => {
            return Err(ResolutionError::invalid(
                id,
                edges::RESULT,
                "exactly one result class is supported",
            ))
        }
    };
    let stats: Vec<ClassRef> = meta
        .classes(node, edges::STATISTIC)
        .iter()
        .map(|class| meta.tags.class_ref(class))
        .collect();
    if stats.is_empty() {
        return Err(ResolutionError::missing(id, "STATISTIC classes"));
    }
    let dims: Vec<Dimension> = meta
        .doc
        .outgoing(id, edges::DIMENSION)
        .filter_map(|(edge, target)| {
            let class = class_from_record(target)?;
            Some(Dimension {
                tag: meta.tags.tag(&class),
                class,
                required: edge.prop_bool("required").unwrap_or(false),
                denominator: edge.prop_bool("denominator").unwrap_or(false),
                all_ct: edge.prop_bool("all_ct").unwrap_or(false),
            })
        })
        .collect();
    let counts: Vec<&ClassRef> = stats
        .iter()
        .filter(|s| COUNT_STATS.contains(&s.tag.as_str()))
        .collect();
    if counts.len() > 1 {
        return Err(ResolutionError::invalid(
            id,
            edges::STATISTIC,
            "percentages need a single count statistic",
        ));
    }
    let package = node
        .prop_str("package")
        .filter(|p| !p.is_empty())
        .unwrap_or(BUILTIN_PACKAGE);
    let script = node
        .prop_str("script")
        .filter(|s| !s.is_empty())
        .unwrap_or("summarise");
    let stat_tags: Vec<&str> = stats.iter().map(|s| s.tag.as_str()).collect();
    let branch1 = format!("{id}_branch1");

    let mut steps = Vec::new();
    let ct: serde_json::Map<String, JsonValue> = dims
        .iter()
        .filter(|d| d.all_ct)
        .map(|d| {
            let terms: Vec<&str> = meta
                .schema
                .terms_of(&d.class.label)
                .map(|t| t.label.as_str())
                .collect();
            (d.tag.clone(), json!(terms))
        })
        .collect();
    if !ct.is_empty() {
        steps.push(Step::new(
            format!("{id}_ct_cartesian_product"),
            remote(node, BUILTIN_PACKAGE, "ct_cartesian_product", json!({ "terms": ct })),
        ));
    }
    steps.push(Step::new(
        branch1.clone(),
        Action::BranchSave(BranchSave {
            key: branch1.clone(),
        }),
    ));

    for (i, combo) in combinations(&dims).iter().enumerate() {
        let dim_tags: Vec<String> = combo.iter().map(|d| d.tag.clone()).collect();
        let dim_refs: Vec<ClassRef> = combo
            .iter()
            .map(|d| ClassRef::new(d.class.label.clone(), d.tag.clone()))
            .collect();
        if i > 0 {
            steps.push(Step::new(
                format!("{id}_branch_load_{i}"),
                Action::BranchLoad(BranchLoad {
                    key: branch1.clone(),
                }),
            ));
        }
        steps.push(Step::new(
            format!("{id}_run_script_{i}"),
            remote(
                node,
                package,
                script,
                json!({
                    "by": summarise_by(combo),
                    "value_cols": [result.tag],
                    "agg": stat_tags,
                }),
            ),
        ));
        steps.push(Step::new(
            format!("{id}_build_uri_{i}"),
            Action::BuildUri(BuildUri {
                prefix: result.tag.clone(),
                targets: stats.clone(),
                by: dim_tags.clone(),
                labels: Vec::new(),
                store_on_existing_nodes: false,
            }),
        ));
        steps.push(Step::new(
            format!("{id}_link_stat_{i}"),
            Action::LinkStat(LinkStat {
                statistics: stats.clone(),
                dimensions: dim_refs.clone(),
            }),
        ));

        let denominators: Vec<&Dimension> =
            combo.iter().copied().filter(|d| d.denominator).collect();
        let Some(count) = counts.first() else {
            continue;
        };
        if denominators.is_empty() || denominators.len() == combo.len() {
            continue;
        }
        steps.extend(percentages(
            node,
            i,
            (package, script),
            &result,
            count,
            &branch1,
            &denominators,
            &dim_refs,
        ));
    }
    Ok(steps)
}

#[allow(clippy::too_many_arguments)]
fn percentages(
    node: &NodeRecord,
    i: usize,
    (package, script): (&str, &str),
    result: &ClassRef,
    count: &ClassRef,
    branch1: &str,
    denominators: &[&Dimension],
    dims: &[ClassRef],
) -> Vec<Step> {
    let id = node.id.as_str();
    let numerator = format!("{id}_numerator_{i}");
    let denominator = format!("{id}_denominator_{i}");
    let denominator_tags: Vec<String> = denominators.iter().map(|d| d.tag.clone()).collect();
    let denominator_refs: Vec<ClassRef> = denominators
        .iter()
        .map(|d| ClassRef::new(d.class.label.clone(), d.tag.clone()))
        .collect();
    let percent = ClassRef::new(PERCENT_CLASS, PERCENT_TAG);
    let stat = &count.tag;
    let rename: serde_json::Map<String, JsonValue> = [
        (stat.clone(), "denominator"),
        (id_column(stat), "_id_denominator"),
        (uri_column(stat), "_uri_denominator"),
    ]
    .into_iter()
    .map(|(from, to)| (from, JsonValue::from(to)))
    .collect();
    vec![
        Step::new(
            numerator.clone(),
            Action::BranchSave(BranchSave {
                key: numerator.clone(),
            }),
        ),
        Step::new(
            format!("{id}_branch_load_denom_{i}"),
            Action::BranchLoad(BranchLoad {
                key: branch1.to_owned(),
            }),
        ),
        Step::new(
            format!("{id}_run_script_denom_{i}"),
            remote(
                node,
                package,
                script,
                json!({
                    "by": summarise_by(denominators),
                    "value_cols": [result.tag],
                    "agg": [stat],
                }),
            ),
        ),
        Step::new(
            format!("{id}_build_denom_uri_{i}"),
            Action::BuildUri(BuildUri {
                prefix: result.tag.clone(),
                targets: vec![count.clone()],
                by: denominator_tags,
                labels: Vec::new(),
                store_on_existing_nodes: false,
            }),
        ),
        Step::new(
            format!("{id}_link_denom_counts_{i}"),
            Action::LinkStat(LinkStat {
                statistics: vec![count.clone()],
                dimensions: denominator_refs,
            }),
        ),
        Step::new(
            format!("{id}_run_script_rename_denom_{i}"),
            builtin("rename_columns", json!({ "mapping": rename })),
        ),
        Step::new(
            denominator.clone(),
            Action::BranchSave(BranchSave {
                key: denominator.clone(),
            }),
        ),
        Step::new(
            format!("{id}_branch_load_numerator_{i}"),
            Action::BranchLoad(BranchLoad { key: numerator }),
        ),
        Step::new(
            format!("{id}_branch_combine_{i}"),
            Action::BranchCombine(BranchCombine {
                keys: vec![denominator],
            }),
        ),
        Step::new(
            format!("{id}_run_script_divide_{i}"),
            builtin(
                "divide",
                json!({ "numerator": stat, "denominator": "denominator", "result": PERCENT_TAG }),
            ),
        ),
        Step::new(
            format!("{id}_run_script_multiply_{i}"),
            builtin("multiply", json!({ "column": PERCENT_TAG, "factor": 100 })),
        ),
        Step::new(
            format!("{id}_build_uri_for_pct_{i}"),
            Action::BuildUri(BuildUri {
                prefix: format!("{}({})", result.tag, stat),
                targets: vec![percent.clone()],
                by: dims.iter().map(|d| d.tag.clone()).collect(),
                labels: Vec::new(),
                store_on_existing_nodes: false,
            }),
        ),
        Step::new(
            format!("{id}_link_pct_{i}"),
            Action::LinkStat(LinkStat {
                statistics: vec![percent.clone()],
                dimensions: dims.to_vec(),
            }),
        ),
        Step::new(
            format!("{id}_link_pct_numerator_{i}"),
            link(
                Endpoint::ids(count.clone()),
                Endpoint::ids(percent.clone()),
                "Numerator of",
            ),
        ),
        Step::new(
            format!("{id}_link_pct_denominator_{i}"),
            link(
                Endpoint::ids(ClassRef::new(count.label.clone(), "denominator")),
                Endpoint::ids(percent),
                "Denominator of",
            ),
        ),
    ]
}

fn decode(meta: &Metadata<'_>, node: &NodeRecord) -> Expanded {
    let id = node.id.as_str();
    let from = meta.class(node, edges::FROM_CLASS)?;
    let to = meta.class(node, edges::TO_CLASS)?;
    let pairs = meta.schema.same_as_pairs(&from.label, &to.label);
    if pairs.is_empty() {
        return Err(ResolutionError::missing(
            id,
            format!("SAME_AS terms between '{}' and '{}'", from.label, to.label),
        ));
    }
    let rel = meta
        .schema
        .relationships_between(&from.label, &to.label)
        .next()
        .ok_or_else(|| {
            ResolutionError::missing(
                id,
                format!("relationship between '{}' and '{}'", from.label, to.label),
            )
        })?;
    let from_ref = meta.tags.class_ref(&from);
    let to_ref = meta.tags.class_ref(&to);
    let mapping: serde_json::Map<String, JsonValue> = pairs
        .into_iter()
        .map(|(a, b)| (a, JsonValue::String(b)))
        .collect();
    let remove_unmapped = node.prop_bool("remove_unmapped_rows").unwrap_or(true);
    let link_action = if rel.from == from.label {
        link(Endpoint::ids(from_ref.clone()), Endpoint::values(to_ref.clone(), true, false), rel.edge_type())
    } else {
        link(Endpoint::values(to_ref.clone(), true, false), Endpoint::ids(from_ref.clone()), rel.edge_type())
    };
    Ok(vec![
        Step::new(
            format!("{id}_run_script"),
            remote(
                node,
                BUILTIN_PACKAGE,
                "remap_term_values",
                json!({
                    "column": from_ref.tag,
                    "target": to_ref.tag,
                    "mapping": mapping,
                    "remove_unmapped_rows": remove_unmapped,
                }),
            ),
        ),
        Step::new(format!("{id}_link"), link_action),
    ])
}

/// Class from the schema, or a default with the given short label.
fn well_known(meta: &Metadata<'_>, label: &str, short: &str) -> ClassRef {
    let class = meta
        .schema
        .class(label)
        .cloned()
        .unwrap_or_else(|| ClassNode::new(label).with_short_label(short));
    meta.tags.class_ref(&class)
}

fn subject_level_link(meta: &Metadata<'_>, node: &NodeRecord) -> Expanded {
    let id = node.id.as_str();
    let class = meta.class(node, edges::SUBJECT_LEVEL)?;
    let term = meta
        .doc
        .outgoing(id, edges::TERM)
        .find_map(|(_, t)| t.prop_str(VALUE_PROPERTY))
        .unwrap_or(&class.label)
        .to_owned();
    let on = meta.tags.class_ref(&class);
    let param = well_known(meta, "Parameter", "PARAM");
    let value = if class.is_numeric() {
        well_known(meta, "Analysis Value", "AVAL")
    } else {
        well_known(meta, "Analysis Value (C)", "AVALC")
    };
    let record = well_known(meta, "Record", "RECORD");
    let subject = well_known(meta, "Subject", "USUBJID");
    Ok(vec![
        Step::new(
            format!("{id}_assign_class"),
            Action::AssignLabel(AssignLabel {
                on,
                target: value.clone(),
            }),
        ),
        Step::new(
            format!("{id}_build_uri"),
            Action::BuildUri(BuildUri {
                prefix: format!("Subject_level_{term}"),
                targets: vec![record.clone()],
                by: vec![subject.tag.clone()],
                labels: Vec::new(),
                store_on_existing_nodes: false,
            }),
        ),
        Step::new(
            format!("{id}_record_link"),
            link(
                Endpoint::ids(subject),
                Endpoint::values(record.clone(), true, true),
                record.label.clone(),
            ),
        ),
        Step::new(
            format!("{id}_param_link"),
            link(
                Endpoint::ids(record.clone()),
                Endpoint::pinned(param.clone(), term),
                param.label.clone(),
            ),
        ),
        Step::new(
            format!("{id}_record_value_link"),
            link(Endpoint::ids(record), Endpoint::ids(value.clone()), value.label),
        ),
    ])
}
