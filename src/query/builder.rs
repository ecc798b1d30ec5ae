//! Translation of [`DataRequest`]s into [`QueryPlan`]s.
//!
//! The builder is stateless apart from the schema it borrows for tag
//! resolution and relationship inference. Translation runs in four passes:
//! resolve relationships, assign tags, split classes into mandatory and
//! optional match groups, then compile constraints into predicates.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use tracing::debug;

use crate::model::Schema;
use crate::query::{
    ast::{
        ColumnSource, EdgeClause, MatchGroup, NodePattern, OutputColumn, PropPredicate, Var,
    },
    errors::QueryBuildError,
    plan::QueryPlan,
    request::{ColumnNaming, Condition, DataRequest, RangeSpec},
};
use crate::value::Value;

type BuildResult<T> = std::result::Result<T, QueryBuildError>;

/// Prefix of identifier columns.
pub const ID_PREFIX: &str = "_id_";
/// Prefix of URI columns.
pub const URI_PREFIX: &str = "_uri_";

/// Identifier column name for a tag.
pub fn id_column(tag: &str) -> String {
    format!("{ID_PREFIX}{tag}")
}

/// URI column name for a tag.
pub fn uri_column(tag: &str) -> String {
    format!("{URI_PREFIX}{tag}")
}

#[derive(Clone, Debug, PartialEq)]
struct Rel {
    from: String,
    to: String,
    edge_type: String,
    short_label: Option<String>,
    optional: bool,
}

#[derive(Debug, Default)]
struct Group {
    optional: bool,
    labels: Vec<String>,
    rels: Vec<usize>,
}

/// Stateless translator from data requests to query plans.
#[derive(Clone, Copy, Debug)]
pub struct QueryBuilder<'s> {
    schema: &'s Schema,
}

impl<'s> QueryBuilder<'s> {
    /// Builder resolving tags and inferred relationships against `schema`.
    pub fn new(schema: &'s Schema) -> Self {
        Self { schema }
    }

    /// Translates a request.
    pub fn build(&self, request: &DataRequest) -> BuildResult<QueryPlan> {
        let options = &request.options;
        let limit = match options.limit {
            Some(limit) if limit <= 0 => return Err(QueryBuildError::InvalidLimit { limit }),
            Some(limit) => Some(limit as usize),
            None => None,
        };
        if request.is_empty() {
            return Ok(QueryPlan::empty());
        }

        let rels = self.resolve_relationships(request)?;
        let mut output: Vec<String> = Vec::new();
        for class in &request.classes {
            push_unique(&mut output, &class.label);
        }
        if !request.relationships.is_empty() {
            for rel in &rels {
                push_unique(&mut output, &rel.from);
                push_unique(&mut output, &rel.to);
            }
        }
        let mut all = output.clone();
        for rel in &rels {
            push_unique(&mut all, &rel.from);
            push_unique(&mut all, &rel.to);
        }

        for class in request.where_map.keys().chain(request.where_rel_map.keys()) {
            if !all.contains(class) {
                return Err(QueryBuildError::UnknownClass {
                    class: class.clone(),
                });
            }
        }

        let tags = self.assign_tags(&all, &rels, options.naming)?;
        let optional = optionality(&all, request, &rels);
        let groups = group_classes(&all, &optional, &rels, options.allow_unrelated_subgraphs)?;

        let mut params = BTreeMap::new();
        let mut predicates: HashMap<&str, Vec<PropPredicate>> = HashMap::new();
        let mut counter = 0usize;
        for (class, props) in &request.where_map {
            for (prop, condition) in props {
                let predicate =
                    compile_condition(var_of(&tags, class), class, prop, condition, &mut params, &mut counter)?;
                predicates.entry(class).or_default().push(predicate);
            }
        }
        for (class, checks) in &request.where_rel_map {
            for check in checks {
                predicates.entry(class).or_default().push(PropPredicate::Exists {
                    var: var_of(&tags, class),
                    negated: check.negated,
                    direction: check.direction,
                    include: check.include.clone(),
                    exclude: check.exclude.clone(),
                });
            }
        }

        let match_groups: Vec<MatchGroup> = groups
            .iter()
            .map(|group| MatchGroup {
                optional: group.optional,
                nodes: group
                    .labels
                    .iter()
                    .map(|label| NodePattern {
                        var: var_of(&tags, label),
                        label: label.clone(),
                    })
                    .collect(),
                edges: group
                    .rels
                    .iter()
                    .map(|&idx| EdgeClause {
                        from: var_of(&tags, &rels[idx].from),
                        to: var_of(&tags, &rels[idx].to),
                        edge_type: rels[idx].edge_type.clone(),
                    })
                    .collect(),
                predicates: group
                    .labels
                    .iter()
                    .flat_map(|label| predicates.remove(label.as_str()).unwrap_or_default())
                    .collect(),
            })
            .collect();

        let mut columns = Vec::with_capacity(output.len() * 2);
        for label in &output {
            let tag = var_of(&tags, label).0;
            columns.push(OutputColumn {
                name: tag.clone(),
                var: Var(tag.clone()),
                source: ColumnSource::Property {
                    prop: options.value_property.clone(),
                },
            });
            columns.push(OutputColumn {
                name: id_column(&tag),
                var: Var(tag.clone()),
                source: ColumnSource::NodeId,
            });
        }

        let plan = QueryPlan::assemble(match_groups, columns, params, limit);
        debug!(
            hash = plan.hash,
            groups = plan.groups.len(),
            columns = plan.columns.len(),
            "query.plan.built"
        );
        Ok(plan)
    }

    fn resolve_relationships(&self, request: &DataRequest) -> BuildResult<Vec<Rel>> {
        if !request.relationships.is_empty() {
            return request
                .relationships
                .iter()
                .map(|r| {
                    if r.from.is_empty() || r.to.is_empty() {
                        return Err(QueryBuildError::EmptyEndpoint {
                            from: r.from.clone(),
                            to: r.to.clone(),
                        });
                    }
                    Ok(Rel {
                        from: r.from.clone(),
                        to: r.to.clone(),
                        edge_type: r.edge_type().to_owned(),
                        short_label: r.short_label.clone(),
                        optional: r.optional,
                    })
                })
                .collect();
        }
        if !request.options.infer_rels {
            return Ok(Vec::new());
        }
        let optional_classes: HashSet<&str> = request
            .classes
            .iter()
            .filter(|c| c.optional)
            .map(|c| c.label.as_str())
            .collect();
        let mut rels: Vec<Rel> = Vec::new();
        for (i, a) in request.classes.iter().enumerate() {
            for b in &request.classes[i + 1..] {
                let Some(path) = self.schema.shortest_path(&a.label, &b.label) else {
                    continue;
                };
                let optional =
                    optional_classes.contains(a.label.as_str()) || optional_classes.contains(b.label.as_str());
                for step in path {
                    let rel = Rel {
                        from: step.from.clone(),
                        to: step.to.clone(),
                        edge_type: step.edge_type().to_owned(),
                        short_label: step.short_label.clone(),
                        optional,
                    };
                    match rels.iter_mut().find(|r| {
                        r.from == rel.from && r.to == rel.to && r.edge_type == rel.edge_type
                    }) {
                        Some(existing) => existing.optional &= rel.optional,
                        None => rels.push(rel),
                    }
                }
            }
        }
        debug!(inferred = rels.len(), "query.rels.inferred");
        Ok(rels)
    }

    fn assign_tags(
        &self,
        labels: &[String],
        rels: &[Rel],
        naming: ColumnNaming,
    ) -> BuildResult<HashMap<String, String>> {
        let mut tags = HashMap::with_capacity(labels.len());
        let mut owners: HashMap<String, &str> = HashMap::new();
        for label in labels {
            let tag = match naming {
                ColumnNaming::Label => label.clone(),
                ColumnNaming::ShortLabel => rels
                    .iter()
                    .find(|r| &r.to == label && r.short_label.is_some())
                    .and_then(|r| r.short_label.clone())
                    .unwrap_or_else(|| self.schema.tag_of(label).to_owned()),
            };
            if let Some(first) = owners.insert(tag.clone(), label.as_str()) {
                return Err(QueryBuildError::AmbiguousTag {
                    tag,
                    first: first.to_owned(),
                    second: label.clone(),
                });
            }
            tags.insert(label.clone(), tag);
        }
        Ok(tags)
    }
}

fn var_of(tags: &HashMap<String, String>, label: &str) -> Var {
    Var(tags.get(label).cloned().unwrap_or_else(|| label.to_owned()))
}

fn push_unique(list: &mut Vec<String>, label: &str) {
    if !list.iter().any(|l| l == label) {
        list.push(label.to_owned());
    }
}

/// A class is optional when every relationship it takes part in is
/// optional for it. If all relationships are optional, their `from` side
/// stays mandatory so the query has something to anchor on. Classes outside
/// any relationship follow the request flag.
fn optionality(all: &[String], request: &DataRequest, rels: &[Rel]) -> HashMap<String, bool> {
    let all_optional = !rels.is_empty() && rels.iter().all(|r| r.optional);
    let mut optional: HashMap<String, bool> = HashMap::new();
    for rel in rels {
        for (label, is_to) in [(&rel.from, false), (&rel.to, true)] {
            let rel_opt = if all_optional {
                rel.optional && is_to
            } else {
                rel.optional
            };
            optional
                .entry(label.clone())
                .and_modify(|o| *o &= rel_opt)
                .or_insert(rel_opt);
        }
    }
    for label in all {
        if !optional.contains_key(label) {
            let requested_optional = request
                .classes
                .iter()
                .any(|c| &c.label == label && c.optional);
            optional.insert(label.clone(), requested_optional);
        }
    }
    optional
}

fn group_classes(
    all: &[String],
    optional: &HashMap<String, bool>,
    rels: &[Rel],
    allow_unrelated: bool,
) -> BuildResult<Vec<Group>> {
    let is_mandatory = |label: &str| !optional.get(label).copied().unwrap_or(false);
    let mandatory: Vec<&String> = all.iter().filter(|l| is_mandatory(l)).collect();

    // Connected components of the mandatory classes over mandatory relationships.
    let mut component_of: HashMap<&str, usize> = HashMap::new();
    let mut components: Vec<Group> = Vec::new();
    for &label in &mandatory {
        if component_of.contains_key(label.as_str()) {
            continue;
        }
        let id = components.len();
        let mut group = Group::default();
        let mut stack = vec![label.as_str()];
        component_of.insert(label, id);
        while let Some(current) = stack.pop() {
            group.labels.push(current.to_owned());
            for rel in rels.iter().filter(|r| !r.optional) {
                let next = if rel.from == current {
                    &rel.to
                } else if rel.to == current {
                    &rel.from
                } else {
                    continue;
                };
                if is_mandatory(next) && !component_of.contains_key(next.as_str()) {
                    component_of.insert(next, id);
                    stack.push(next);
                }
            }
        }
        components.push(group);
    }
    for (idx, rel) in rels.iter().enumerate() {
        if rel.optional || !is_mandatory(&rel.from) || !is_mandatory(&rel.to) {
            continue;
        }
        if let Some(&c) = component_of.get(rel.from.as_str()) {
            components[c].rels.push(idx);
        }
    }
    for group in &mut components {
        group
            .labels
            .sort_by_key(|l| all.iter().position(|a| a == l).unwrap_or(usize::MAX));
    }

    let mut disconnected: Vec<String> = Vec::new();
    if components.len() > 1 && !allow_unrelated {
        disconnected.extend(components[1..].iter().flat_map(|g| g.labels.iter().cloned()));
    }

    let mut bound: HashSet<String> = mandatory.iter().map(|l| (*l).clone()).collect();
    let mut groups = components;
    let mut optional_group_of: HashMap<String, usize> = HashMap::new();

    let to_mandatory = |label: &str| {
        rels.iter()
            .filter(|r| {
                (r.from == label && is_mandatory(&r.to)) || (r.to == label && is_mandatory(&r.from))
            })
            .count()
    };
    let mut optional_labels: Vec<&String> = all.iter().filter(|l| !is_mandatory(l)).collect();
    optional_labels.sort_by_key(|l| Reverse(to_mandatory(l)));

    let mut assigned: HashSet<usize> = groups.iter().flat_map(|g| g.rels.iter().copied()).collect();
    for label in optional_labels {
        let touching: Vec<usize> = rels
            .iter()
            .enumerate()
            .filter(|(idx, r)| {
                !assigned.contains(idx)
                    && ((r.from == *label && bound.contains(&r.to))
                        || (r.to == *label && bound.contains(&r.from)))
            })
            .map(|(idx, _)| idx)
            .collect();
        if touching.is_empty() && !bound.is_empty() && !allow_unrelated {
            disconnected.push(label.clone());
        }
        let joins_optional = touching.iter().find_map(|&idx| {
            let other = if rels[idx].from == *label {
                &rels[idx].to
            } else {
                &rels[idx].from
            };
            optional_group_of.get(other).copied()
        });
        let target = match joins_optional {
            Some(g) if to_mandatory(label) == 0 => g,
            _ => {
                groups.push(Group {
                    optional: true,
                    ..Group::default()
                });
                groups.len() - 1
            }
        };
        groups[target].labels.push(label.clone());
        groups[target].rels.extend(touching.iter().copied());
        assigned.extend(touching);
        optional_group_of.insert(label.clone(), target);
        bound.insert(label.clone());
    }

    // Optional relationships between classes that were already bound.
    let leftovers: Vec<usize> = (0..rels.len()).filter(|idx| !assigned.contains(idx)).collect();
    for idx in leftovers {
        groups.push(Group {
            optional: true,
            labels: Vec::new(),
            rels: vec![idx],
        });
    }

    if !disconnected.is_empty() {
        return Err(QueryBuildError::Disconnected {
            classes: disconnected,
        });
    }
    Ok(groups)
}

fn compile_condition(
    var: Var,
    class: &str,
    prop: &str,
    condition: &Condition,
    params: &mut BTreeMap<String, Value>,
    counter: &mut usize,
) -> BuildResult<PropPredicate> {
    let mut next_param = |value: Value| {
        *counter += 1;
        let name = format!("par_{counter}");
        params.insert(name.clone(), value);
        name
    };
    let invalid = |reason: &str| QueryBuildError::InvalidCondition {
        class: class.to_owned(),
        property: prop.to_owned(),
        reason: reason.to_owned(),
    };
    Ok(match condition {
        Condition::Equals(Value::Null) => {
            return Err(invalid("equality with null never matches; use a range with incl_null"))
        }
        Condition::Equals(value) => PropPredicate::Eq {
            var,
            prop: prop.to_owned(),
            value: value.clone(),
            param: next_param(value.clone()),
        },
        Condition::OneOf(values) => PropPredicate::In {
            var,
            prop: prop.to_owned(),
            values: values.clone(),
            param: next_param(Value::List(values.clone())),
        },
        Condition::NotIn(values) => PropPredicate::Not(Box::new(PropPredicate::In {
            var,
            prop: prop.to_owned(),
            values: values.clone(),
            param: next_param(Value::List(values.clone())),
        })),
        Condition::Range(range) => {
            let RangeSpec {
                min,
                max,
                min_include,
                max_include,
                incl_null,
            } = range;
            for limit in [min, max].into_iter().flatten() {
                if matches!(limit, Value::List(_) | Value::Map(_) | Value::Null) {
                    return Err(invalid("range bounds must be scalars"));
                }
            }
            let lower_param = min.clone().map(&mut next_param);
            let upper_param = max.clone().map(&mut next_param);
            PropPredicate::Range {
                var,
                prop: prop.to_owned(),
                lower: bound(min, *min_include),
                upper: bound(max, *max_include),
                params: (lower_param, upper_param),
                include_null: *incl_null,
            }
        }
    })
}

fn bound(value: &Option<Value>, inclusive: bool) -> Bound<Value> {
    match value {
        Some(v) if inclusive => Bound::Included(v.clone()),
        Some(v) => Bound::Excluded(v.clone()),
        None => Bound::Unbounded,
    }
}
