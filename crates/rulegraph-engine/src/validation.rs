use crate::template::{extract_variables, find_malformed, slot_names};
use rulegraph_core::{
    PrimitiveCategory, Relation, RelationId, Result, Rule, RuleGraphError, RuleRef, RuleScope,
    RuleStore, RuleType,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const TASK_ATTRIBUTES: [&str; 3] = ["language", "framework", "domain"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingRule,
    EmptyField,
    InvalidCategory,
    TierViolation,
    MalformedPlaceholder,
    UndocumentedVariable,
    OrderConflict,
    DuplicateEdge,
    DuplicateChildName,
    DuplicateName,
    CyclicDependency,
}

/// A soft finding; collected into reports, never raised
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub rule: Option<RuleRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_rules: Vec<RuleRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub relation_ids: Vec<RelationId>,
    pub message: String,
}

impl Issue {
    fn new(severity: Severity, kind: IssueKind, rule: RuleRef, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            rule: Some(rule),
            related_rules: Vec::new(),
            relation_ids: Vec::new(),
            message: message.into(),
        }
    }

    fn error(kind: IssueKind, rule: RuleRef, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, kind, rule, message)
    }

    fn warning(kind: IssueKind, rule: RuleRef, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, kind, rule, message)
    }

    fn with_relations(mut self, ids: Vec<RelationId>) -> Self {
        self.relation_ids = ids;
        self
    }

    fn with_related(mut self, rules: Vec<RuleRef>) -> Self {
        self.related_rules = rules;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A dependency loop, first node repeated at the end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub path: Vec<RuleRef>,
}

impl CycleReport {
    /// Rotation-independent identity of the loop
    fn canonical(&self) -> Vec<RuleRef> {
        let ring = &self.path[..self.path.len().saturating_sub(1)];
        let Some(start) = ring
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| **r)
            .map(|(i, _)| i)
        else {
            return Vec::new();
        };
        ring[start..].iter().chain(&ring[..start]).copied().collect()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.path.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(" -> "))
    }
}

type Adjacency = BTreeMap<RuleRef, Vec<Relation>>;

/// Structural checks over the rule graph.
///
/// Traverses the same edges the resolver follows, via `list_children`.
#[derive(Clone)]
pub struct RuleValidator {
    store: Arc<dyn RuleStore>,
}

impl RuleValidator {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    /// Every node reachable from `roots`, with its outgoing edges
    async fn load_adjacency(&self, roots: &[RuleRef]) -> Result<Adjacency> {
        let mut adjacency = Adjacency::new();
        let mut queue: VecDeque<RuleRef> = roots.iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if adjacency.contains_key(&node) {
                continue;
            }
            let mut children = self.store.list_children(node).await?;
            children.sort_by(Relation::sibling_order);
            queue.extend(
                children
                    .iter()
                    .map(|r| r.child)
                    .filter(|c| !adjacency.contains_key(c)),
            );
            adjacency.insert(node, children);
        }
        Ok(adjacency)
    }

    async fn scope_roots(&self, scope: RuleScope) -> Result<Vec<RuleRef>> {
        Ok(self
            .store
            .list_rules(scope)
            .await?
            .iter()
            .map(Rule::rule_ref)
            .collect())
    }

    /// Cycles reachable from `root`
    pub async fn detect_cycles(&self, root: RuleRef) -> Result<Vec<CycleReport>> {
        let adjacency = self.load_adjacency(&[root]).await?;
        Ok(find_cycles(&adjacency, &[root]))
    }

    /// Every distinct cycle reachable from rules in `scope`
    pub async fn detect_all_cycles(&self, scope: RuleScope) -> Result<Vec<CycleReport>> {
        let roots = self.scope_roots(scope).await?;
        let adjacency = self.load_adjacency(&roots).await?;
        let cycles = find_cycles(&adjacency, &roots);
        debug!("Cycle scan over {} rules found {} cycles", adjacency.len(), cycles.len());
        Ok(cycles)
    }

    /// Field, reference and placeholder checks for `root` and everything below it
    pub async fn check_consistency(
        &self,
        root: RuleRef,
        known_variables: &BTreeSet<String>,
    ) -> Result<Vec<Issue>> {
        if self.store.get_rule(root).await?.is_none() {
            return Err(RuleGraphError::NotFound(format!("rule {}", root)));
        }
        let adjacency = self.load_adjacency(&[root]).await?;
        self.check_nodes(&adjacency, known_variables).await
    }

    /// Consistency checks for every rule in `scope`
    pub async fn check_consistency_all(
        &self,
        scope: RuleScope,
        known_variables: &BTreeSet<String>,
    ) -> Result<Vec<Issue>> {
        let mut adjacency = Adjacency::new();
        for root in self.scope_roots(scope).await? {
            let mut children = self.store.list_children(root).await?;
            children.sort_by(Relation::sibling_order);
            adjacency.insert(root, children);
        }
        self.check_nodes(&adjacency, known_variables).await
    }

    async fn check_nodes(
        &self,
        adjacency: &Adjacency,
        known_variables: &BTreeSet<String>,
    ) -> Result<Vec<Issue>> {
        let mut incoming_overrides: HashMap<RuleRef, BTreeSet<String>> = HashMap::new();
        for relation in self.store.list_relations().await? {
            incoming_overrides
                .entry(relation.child)
                .or_default()
                .extend(relation.context_override.keys().cloned());
        }

        let mut issues = Vec::new();
        let mut reported_missing = HashSet::new();

        for (node, relations) in adjacency {
            // Missing targets are reported on the edge that names them
            let Some(rule) = self.store.get_rule(*node).await? else {
                continue;
            };

            check_fields(&rule, &mut issues);

            let mut documented: BTreeSet<String> = rule.variables.iter().cloned().collect();
            documented.extend(known_variables.iter().cloned());
            documented.extend(TASK_ATTRIBUTES.iter().map(|s| s.to_string()));
            if let Some(child_type) = rule.rule_type.child_type() {
                documented.extend(slot_names(child_type));
            }
            if let Some(keys) = incoming_overrides.get(node) {
                documented.extend(keys.iter().cloned());
            }
            check_placeholders(&rule, &documented, &mut issues);

            for relation in relations {
                if rule.rule_type.child_type() != Some(relation.child.rule_type) {
                    issues.push(
                        Issue::error(
                            IssueKind::TierViolation,
                            *node,
                            format!(
                                "{} rules may not depend on {} rules (relation {})",
                                rule.rule_type, relation.child.rule_type, relation.id
                            ),
                        )
                        .with_relations(vec![relation.id])
                        .with_related(vec![relation.child]),
                    );
                }
                if self.store.get_rule(relation.child).await?.is_none()
                    && reported_missing.insert(relation.id)
                {
                    issues.push(
                        Issue::error(
                            IssueKind::MissingRule,
                            *node,
                            format!(
                                "Relation {} references missing rule {}",
                                relation.id, relation.child
                            ),
                        )
                        .with_relations(vec![relation.id])
                        .with_related(vec![relation.child]),
                    );
                }
            }
        }

        Ok(issues)
    }

    /// Sibling conflicts under `root` and every composite below it
    pub async fn check_conflicts(&self, root: RuleRef) -> Result<Vec<Issue>> {
        let adjacency = self.load_adjacency(&[root]).await?;
        self.conflicts_in(&adjacency).await
    }

    pub async fn check_conflicts_all(&self, scope: RuleScope) -> Result<Vec<Issue>> {
        let mut adjacency = Adjacency::new();
        for root in self.scope_roots(scope).await? {
            adjacency.insert(root, self.store.list_children(root).await?);
        }
        self.conflicts_in(&adjacency).await
    }

    async fn conflicts_in(&self, adjacency: &Adjacency) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();

        for (parent, relations) in adjacency {
            let mut by_order: BTreeMap<i32, Vec<RelationId>> = BTreeMap::new();
            let mut by_child: BTreeMap<RuleRef, Vec<RelationId>> = BTreeMap::new();
            for relation in relations {
                by_order
                    .entry(relation.order_index)
                    .or_default()
                    .push(relation.id);
                by_child.entry(relation.child).or_default().push(relation.id);
            }

            for (order_index, mut ids) in by_order {
                if ids.len() > 1 {
                    ids.sort_unstable();
                    issues.push(
                        Issue::warning(
                            IssueKind::OrderConflict,
                            *parent,
                            format!(
                                "Relations {} share order_index {} under {}; ordered by weight then id",
                                join_ids(&ids),
                                order_index,
                                parent
                            ),
                        )
                        .with_relations(ids),
                    );
                }
            }

            let mut by_name: BTreeMap<(RuleType, String), Vec<RuleRef>> = BTreeMap::new();
            for (child, mut ids) in by_child {
                if ids.len() > 1 {
                    ids.sort_unstable();
                    issues.push(
                        Issue::error(
                            IssueKind::DuplicateEdge,
                            *parent,
                            format!(
                                "{} is attached to {} by relations {}",
                                child,
                                parent,
                                join_ids(&ids)
                            ),
                        )
                        .with_relations(ids)
                        .with_related(vec![child]),
                    );
                }
                if let Some(rule) = self.store.get_rule(child).await? {
                    by_name
                        .entry((rule.rule_type, rule.name))
                        .or_default()
                        .push(child);
                }
            }

            for ((_, name), children) in by_name {
                if children.len() > 1 {
                    let ids = relations
                        .iter()
                        .filter(|r| children.contains(&r.child))
                        .map(|r| r.id)
                        .collect();
                    issues.push(
                        Issue::warning(
                            IssueKind::DuplicateChildName,
                            *parent,
                            format!(
                                "{} has {} distinct children named '{}'",
                                parent,
                                children.len(),
                                name
                            ),
                        )
                        .with_relations(ids)
                        .with_related(children),
                    );
                }
            }
        }

        Ok(issues)
    }

    /// Names reused inside one tier, e.g. after a merged import
    pub async fn check_duplicate_names(&self, scope: RuleScope) -> Result<Vec<Issue>> {
        let mut by_name: BTreeMap<(RuleType, String), Vec<RuleRef>> = BTreeMap::new();
        for rule in self.store.list_rules(scope).await? {
            by_name
                .entry((rule.rule_type, rule.name.clone()))
                .or_default()
                .push(rule.rule_ref());
        }

        Ok(by_name
            .into_iter()
            .filter(|(_, rules)| rules.len() > 1)
            .map(|((rule_type, name), rules)| {
                Issue::error(
                    IssueKind::DuplicateName,
                    rules[0],
                    format!("{} {} rules are named '{}'", rules.len(), rule_type, name),
                )
                .with_related(rules)
            })
            .collect())
    }
}

fn check_fields(rule: &Rule, issues: &mut Vec<Issue>) {
    let rule_ref = rule.rule_ref();
    if rule.name.trim().is_empty() {
        issues.push(Issue::error(
            IssueKind::EmptyField,
            rule_ref,
            format!("{} has an empty name", rule_ref),
        ));
    }
    if rule.template.trim().is_empty() {
        issues.push(Issue::error(
            IssueKind::EmptyField,
            rule_ref,
            format!("{} has an empty {}", rule_ref, rule.rule_type.template_field()),
        ));
    }
    if rule.rule_type == RuleType::Primitive {
        let valid = rule
            .category
            .as_deref()
            .and_then(PrimitiveCategory::parse)
            .is_some();
        if !valid {
            let allowed: Vec<&str> = PrimitiveCategory::ALL.iter().map(|c| c.as_str()).collect();
            issues.push(Issue::error(
                IssueKind::InvalidCategory,
                rule_ref,
                format!(
                    "{} has category {:?}; expected one of: {}",
                    rule_ref,
                    rule.category.as_deref().unwrap_or(""),
                    allowed.join(", ")
                ),
            ));
        }
    }
}

fn check_placeholders(rule: &Rule, documented: &BTreeSet<String>, issues: &mut Vec<Issue>) {
    let rule_ref = rule.rule_ref();
    for malformed in find_malformed(&rule.template) {
        issues.push(Issue::warning(
            IssueKind::MalformedPlaceholder,
            rule_ref,
            format!("{} contains malformed placeholder {}", rule_ref, malformed),
        ));
    }
    for variable in extract_variables(&rule.template) {
        if !documented.contains(&variable) {
            issues.push(Issue::warning(
                IssueKind::UndocumentedVariable,
                rule_ref,
                format!(
                    "{} references variable '{}' that is neither documented nor supplied",
                    rule_ref, variable
                ),
            ));
        }
    }
}

fn join_ids(ids: &[RelationId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Depth-first search that records a cycle when an edge returns to the
/// current path and does not descend past it
fn find_cycles(adjacency: &Adjacency, roots: &[RuleRef]) -> Vec<CycleReport> {
    fn visit(
        node: RuleRef,
        adjacency: &Adjacency,
        path: &mut Vec<RuleRef>,
        done: &mut HashSet<RuleRef>,
        found: &mut Vec<CycleReport>,
    ) {
        path.push(node);
        for relation in adjacency.get(&node).map(Vec::as_slice).unwrap_or_default() {
            let child = relation.child;
            if let Some(start) = path.iter().position(|r| *r == child) {
                let mut cycle = path[start..].to_vec();
                cycle.push(child);
                found.push(CycleReport { path: cycle });
                continue;
            }
            if !done.contains(&child) {
                visit(child, adjacency, path, done, found);
            }
        }
        path.pop();
        done.insert(node);
    }

    let mut found = Vec::new();
    let mut done = HashSet::new();
    for root in roots {
        if !done.contains(root) {
            visit(*root, adjacency, &mut Vec::new(), &mut done, &mut found);
        }
    }

    let mut seen = HashSet::new();
    found.retain(|cycle| seen.insert(cycle.canonical()));
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(id: RelationId, parent: RuleRef, child: RuleRef) -> Relation {
        Relation {
            id,
            parent,
            child,
            weight: 1.0,
            order_index: 0,
            is_required: true,
            context_override: Default::default(),
        }
    }

    #[test]
    fn test_find_cycles_dedupes_rotations() {
        let a = RuleRef::new(RuleType::Semantic, 1);
        let b = RuleRef::new(RuleType::Semantic, 2);
        let c = RuleRef::new(RuleType::Primitive, 1);
        let mut adjacency = Adjacency::new();
        adjacency.insert(a, vec![rel(1, a, b), rel(3, a, c)]);
        adjacency.insert(b, vec![rel(2, b, a)]);
        adjacency.insert(c, vec![]);

        let cycles = find_cycles(&adjacency, &[a, b, c]);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].path, vec![a, b, a]);
        assert_eq!(cycles[0].to_string(), "semantic:1 -> semantic:2 -> semantic:1");
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let a = RuleRef::new(RuleType::Task, 1);
        let mut adjacency = Adjacency::new();
        adjacency.insert(a, vec![rel(1, a, a)]);
        let cycles = find_cycles(&adjacency, &[a]);
        assert_eq!(cycles, vec![CycleReport { path: vec![a, a] }]);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let t = RuleRef::new(RuleType::Task, 1);
        let s1 = RuleRef::new(RuleType::Semantic, 1);
        let s2 = RuleRef::new(RuleType::Semantic, 2);
        let p = RuleRef::new(RuleType::Primitive, 1);
        let mut adjacency = Adjacency::new();
        adjacency.insert(t, vec![rel(1, t, s1), rel(2, t, s2)]);
        adjacency.insert(s1, vec![rel(3, s1, p)]);
        adjacency.insert(s2, vec![rel(4, s2, p)]);
        adjacency.insert(p, vec![]);
        assert!(find_cycles(&adjacency, &[t]).is_empty());
    }
}
