use crate::{
    MutationEvent, NewRelation, NewRule, Relation, RelationId, Result, Rule, RuleGraphError,
    RuleId, RuleRef, RuleScope, RuleStore, RuleType, RuleUpdate, SearchFields,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Portable dump of rules and relations, used for export/import and backups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSnapshot {
    #[serde(default = "snapshot_format_version")]
    pub format_version: u32,
    #[serde(default = "Utc::now")]
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

fn snapshot_format_version() -> u32 {
    SNAPSHOT_FORMAT_VERSION
}

/// How an import treats rows whose id already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    SkipExisting,
    Overwrite,
}

impl std::str::FromStr for MergeStrategy {
    type Err = RuleGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip_existing" | "skip" => Ok(Self::SkipExisting),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(RuleGraphError::InvalidOperation(format!(
                "Unknown merge strategy: {}. Must be one of: skip_existing, overwrite",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub rules_imported: usize,
    pub rules_skipped: usize,
    pub relations_imported: usize,
    pub relations_skipped: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    rules: BTreeMap<RuleRef, Rule>,
    relations: BTreeMap<RelationId, Relation>,
    next_rule_ids: HashMap<RuleType, RuleId>,
    next_relation_id: RelationId,
}

impl StoreState {
    fn allocate_rule_id(&mut self, rule_type: RuleType) -> RuleId {
        let next = self.next_rule_ids.entry(rule_type).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    fn allocate_relation_id(&mut self) -> RelationId {
        self.next_relation_id = self.next_relation_id.max(1);
        let id = self.next_relation_id;
        self.next_relation_id += 1;
        id
    }

    fn name_taken(&self, rule_type: RuleType, name: &str, except: Option<RuleRef>) -> bool {
        self.rules
            .values()
            .any(|r| r.rule_type == rule_type && r.name == name && Some(r.rule_ref()) != except)
    }

    fn resync_counters(&mut self) {
        for rule_type in RuleType::ALL {
            let max = self
                .rules
                .keys()
                .filter(|r| r.rule_type == rule_type)
                .map(|r| r.id)
                .max()
                .unwrap_or(0);
            let next = self.next_rule_ids.entry(rule_type).or_insert(1);
            *next = (*next).max(max + 1);
        }
        let max_rel = self.relations.keys().max().copied().unwrap_or(0);
        self.next_relation_id = self.next_relation_id.max(max_rel + 1);
    }
}

/// In-process rule store.
///
/// Enforces the relational invariants on its write path (per-tier unique
/// names, unique parent/child pairs, tier-ordered edges). Snapshot imports are
/// loaded verbatim, like restoring a database backup.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    state: RwLock<StoreState>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_rule(&self, rule_type: RuleType, new_rule: NewRule) -> Result<(Rule, MutationEvent)> {
        if new_rule.name.trim().is_empty() {
            return Err(RuleGraphError::InvalidOperation(
                "Rule name must not be empty".to_string(),
            ));
        }

        let mut state = self.state.write();
        if state.name_taken(rule_type, &new_rule.name, None) {
            return Err(RuleGraphError::InvalidOperation(format!(
                "A {} rule named '{}' already exists",
                rule_type, new_rule.name
            )));
        }

        let now = Utc::now();
        let rule = Rule {
            id: state.allocate_rule_id(rule_type),
            rule_type,
            name: new_rule.name,
            template: new_rule.template,
            description: new_rule.description,
            category: new_rule.category,
            language: new_rule.language,
            framework: new_rule.framework,
            domain: new_rule.domain,
            variables: new_rule.variables,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        state.rules.insert(rule.rule_ref(), rule.clone());
        debug!("Created {} rule '{}'", rule.rule_ref(), rule.name);

        let event = MutationEvent::RuleCreated {
            rule: rule.rule_ref(),
            name: rule.name.clone(),
        };
        Ok((rule, event))
    }

    pub fn update_rule(&self, rule_ref: RuleRef, update: RuleUpdate) -> Result<(Rule, MutationEvent)> {
        let mut state = self.state.write();
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(RuleGraphError::InvalidOperation(
                    "Rule name must not be empty".to_string(),
                ));
            }
            if state.name_taken(rule_ref.rule_type, name, Some(rule_ref)) {
                return Err(RuleGraphError::InvalidOperation(format!(
                    "A {} rule named '{}' already exists",
                    rule_ref.rule_type, name
                )));
            }
        }

        let rule = state
            .rules
            .get_mut(&rule_ref)
            .ok_or_else(|| RuleGraphError::NotFound(rule_ref.to_string()))?;

        if let Some(template) = update.template {
            if template != rule.template {
                rule.template = template;
                rule.version += 1;
            }
        }
        if let Some(name) = update.name {
            rule.name = name;
        }
        if update.description.is_some() {
            rule.description = update.description;
        }
        if update.category.is_some() {
            rule.category = update.category;
        }
        if update.language.is_some() {
            rule.language = update.language;
        }
        if update.framework.is_some() {
            rule.framework = update.framework;
        }
        if update.domain.is_some() {
            rule.domain = update.domain;
        }
        if let Some(variables) = update.variables {
            rule.variables = variables;
        }
        rule.updated_at = Utc::now();

        let rule = rule.clone();
        let event = MutationEvent::RuleUpdated {
            rule: rule_ref,
            name: rule.name.clone(),
        };
        Ok((rule, event))
    }

    /// Deletes a rule and every relation touching it
    pub fn delete_rule(&self, rule_ref: RuleRef) -> Result<Vec<MutationEvent>> {
        let mut state = self.state.write();
        let rule = state
            .rules
            .remove(&rule_ref)
            .ok_or_else(|| RuleGraphError::NotFound(rule_ref.to_string()))?;

        let attached: Vec<RelationId> = state
            .relations
            .values()
            .filter(|r| r.parent == rule_ref || r.child == rule_ref)
            .map(|r| r.id)
            .collect();

        let mut events = vec![MutationEvent::RuleDeleted {
            rule: rule_ref,
            name: rule.name,
        }];
        for id in attached {
            if let Some(rel) = state.relations.remove(&id) {
                events.push(MutationEvent::RelationDeleted {
                    parent: rel.parent,
                    child: rel.child,
                });
            }
        }
        Ok(events)
    }

    pub fn create_relation(&self, new_relation: NewRelation) -> Result<(Relation, MutationEvent)> {
        let NewRelation {
            parent,
            child,
            weight,
            order_index,
            is_required,
            context_override,
        } = new_relation;

        if parent.rule_type.child_type() != Some(child.rule_type) {
            return Err(RuleGraphError::InvalidOperation(format!(
                "A {} rule cannot depend on a {} rule",
                parent.rule_type, child.rule_type
            )));
        }
        if !weight.is_finite() {
            return Err(RuleGraphError::InvalidOperation(format!(
                "Relation weight must be finite, got {}",
                weight
            )));
        }

        let mut state = self.state.write();
        for endpoint in [parent, child] {
            if !state.rules.contains_key(&endpoint) {
                return Err(RuleGraphError::NotFound(endpoint.to_string()));
            }
        }
        if state
            .relations
            .values()
            .any(|r| r.parent == parent && r.child == child)
        {
            return Err(RuleGraphError::InvalidOperation(format!(
                "Relation {} -> {} already exists",
                parent, child
            )));
        }

        let relation = Relation {
            id: state.allocate_relation_id(),
            parent,
            child,
            weight,
            order_index,
            is_required,
            context_override,
        };
        state.relations.insert(relation.id, relation.clone());

        Ok((relation, MutationEvent::RelationCreated { parent, child }))
    }

    pub fn delete_relation(&self, relation_id: RelationId) -> Result<MutationEvent> {
        let mut state = self.state.write();
        let rel = state
            .relations
            .remove(&relation_id)
            .ok_or_else(|| RuleGraphError::NotFound(format!("relation {}", relation_id)))?;
        Ok(MutationEvent::RelationDeleted {
            parent: rel.parent,
            child: rel.child,
        })
    }

    /// Rules in scope plus the relations whose parent is in scope
    pub fn export_snapshot(&self, scope: RuleScope) -> RuleSnapshot {
        let state = self.state.read();
        RuleSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at: Utc::now(),
            rules: state
                .rules
                .values()
                .filter(|r| scope.includes(r.rule_type))
                .cloned()
                .collect(),
            relations: state
                .relations
                .values()
                .filter(|r| scope.includes(r.parent.rule_type))
                .cloned()
                .collect(),
        }
    }

    /// Loads rows as-is; no tier or reference checks are applied.
    ///
    /// Any row may have been replaced, so the returned event is
    /// [`MutationEvent::Reloaded`].
    pub fn import_snapshot(
        &self,
        snapshot: RuleSnapshot,
        strategy: MergeStrategy,
    ) -> Result<(ImportStats, MutationEvent)> {
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(RuleGraphError::InvalidOperation(format!(
                "Unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }

        let mut stats = ImportStats::default();
        let mut state = self.state.write();

        for rule in snapshot.rules {
            let key = rule.rule_ref();
            if state.rules.contains_key(&key) && strategy == MergeStrategy::SkipExisting {
                stats.rules_skipped += 1;
                continue;
            }
            state.rules.insert(key, rule);
            stats.rules_imported += 1;
        }

        for relation in snapshot.relations {
            if state.relations.contains_key(&relation.id) && strategy == MergeStrategy::SkipExisting {
                stats.relations_skipped += 1;
                continue;
            }
            state.relations.insert(relation.id, relation);
            stats.relations_imported += 1;
        }

        state.resync_counters();
        info!(
            "Imported {} rules ({} skipped) and {} relations ({} skipped)",
            stats.rules_imported, stats.rules_skipped, stats.relations_imported, stats.relations_skipped
        );
        Ok((stats, MutationEvent::Reloaded))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: RuleSnapshot = serde_json::from_str(&content)?;
        let store = Self::new();
        store.import_snapshot(snapshot, MergeStrategy::Overwrite)?;
        info!("Loaded rules from {}", path.display());
        Ok(store)
    }

    pub fn save_to_file(&self, path: &Path, scope: RuleScope) -> Result<()> {
        let snapshot = self.export_snapshot(scope);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.state.read().rules.len()
    }

    pub fn relation_count(&self) -> usize {
        self.state.read().relations.len()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get_rule(&self, rule: RuleRef) -> Result<Option<Rule>> {
        Ok(self.state.read().rules.get(&rule).cloned())
    }

    async fn get_rule_by_name(&self, name: &str, rule_type: RuleType) -> Result<Option<Rule>> {
        let state = self.state.read();
        let mut matches = state
            .rules
            .values()
            .filter(|r| r.rule_type == rule_type && r.name == name);
        let first = matches.next().cloned();
        if matches.next().is_some() {
            warn!("Multiple {} rules named '{}'; using the lowest id", rule_type, name);
        }
        Ok(first)
    }

    async fn list_children(&self, parent: RuleRef) -> Result<Vec<Relation>> {
        let state = self.state.read();
        let mut children: Vec<Relation> = state
            .relations
            .values()
            .filter(|r| r.parent == parent)
            .cloned()
            .collect();
        children.sort_by(Relation::sibling_order);
        Ok(children)
    }

    async fn list_rules(&self, scope: RuleScope) -> Result<Vec<Rule>> {
        Ok(self
            .state
            .read()
            .rules
            .values()
            .filter(|r| scope.includes(r.rule_type))
            .cloned()
            .collect())
    }

    async fn list_relations(&self) -> Result<Vec<Relation>> {
        Ok(self.state.read().relations.values().cloned().collect())
    }

    async fn search_rules(&self, query: &str, fields: SearchFields, scope: RuleScope) -> Result<Vec<Rule>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let contains = |text: &str| text.to_lowercase().contains(&needle);

        Ok(self
            .state
            .read()
            .rules
            .values()
            .filter(|r| scope.includes(r.rule_type))
            .filter(|r| {
                (fields.name() && contains(&r.name))
                    || (fields.content() && contains(&r.template))
                    || (fields.description() && r.description.as_deref().is_some_and(|d| contains(d)))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (MemoryRuleStore, RuleRef, RuleRef, RuleRef) {
        let store = MemoryRuleStore::new();
        let (p, _) = store
            .create_rule(
                RuleType::Primitive,
                NewRule::new("concise", "Be concise.").with_category("instruction"),
            )
            .unwrap();
        let (s, _) = store
            .create_rule(RuleType::Semantic, NewRule::new("tone", "{{tone}}: {{primitive}}"))
            .unwrap();
        let (t, _) = store
            .create_rule(RuleType::Task, NewRule::new("review", "Task: {{semantic}}"))
            .unwrap();
        (store, p.rule_ref(), s.rule_ref(), t.rule_ref())
    }

    #[test]
    fn test_ids_are_assigned_per_tier() {
        let (_, p, s, t) = seeded();
        assert_eq!((p.id, s.id, t.id), (1, 1, 1));
    }

    #[test]
    fn test_names_unique_within_tier_only() {
        let (store, ..) = seeded();
        assert!(store
            .create_rule(RuleType::Primitive, NewRule::new("concise", "again"))
            .is_err());
        assert!(store
            .create_rule(RuleType::Task, NewRule::new("concise", "task named like a primitive"))
            .is_ok());
    }

    #[test]
    fn test_relation_invariants() {
        let (store, p, s, t) = seeded();
        store.create_relation(NewRelation::new(s, p)).unwrap();
        assert!(store.create_relation(NewRelation::new(s, p)).is_err());
        assert!(store.create_relation(NewRelation::new(t, p)).is_err());
        assert!(store
            .create_relation(NewRelation::new(t, RuleRef::new(RuleType::Semantic, 99)))
            .is_err());
    }

    #[test]
    fn test_update_bumps_version_on_template_change_only() {
        let (store, p, ..) = seeded();
        let (rule, _) = store
            .update_rule(
                p,
                RuleUpdate {
                    description: Some("short answers".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rule.version, 1);

        let (rule, event) = store
            .update_rule(
                p,
                RuleUpdate {
                    template: Some("Be brief.".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rule.version, 2);
        assert!(matches!(event, MutationEvent::RuleUpdated { rule, .. } if rule == p));
    }

    #[test]
    fn test_delete_rule_cascades_relations() {
        let (store, p, s, t) = seeded();
        store.create_relation(NewRelation::new(s, p)).unwrap();
        store.create_relation(NewRelation::new(t, s)).unwrap();

        let events = store.delete_rule(s).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(store.relation_count(), 0);
    }

    #[tokio::test]
    async fn test_list_children_sorted() {
        let (store, p, s, _) = seeded();
        let (p2, _) = store
            .create_rule(RuleType::Primitive, NewRule::new("second", "Second."))
            .unwrap();
        let (p3, _) = store
            .create_rule(RuleType::Primitive, NewRule::new("third", "Third."))
            .unwrap();
        store.create_relation(NewRelation::new(s, p).order(2)).unwrap();
        store.create_relation(NewRelation::new(s, p2.rule_ref()).order(0)).unwrap();
        store.create_relation(NewRelation::new(s, p3.rule_ref()).order(1)).unwrap();

        let children = store.list_children(s).await.unwrap();
        let order: Vec<_> = children.iter().map(|r| r.order_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_search_respects_fields() {
        let (store, ..) = seeded();
        let by_name = store
            .search_rules("TONE", SearchFields::Name, RuleScope::All)
            .await
            .unwrap();
        assert_eq!(by_name.len(), 1);

        let by_content = store
            .search_rules("concise", SearchFields::Content, RuleScope::All)
            .await
            .unwrap();
        assert_eq!(by_content.len(), 1);
        assert_eq!(by_content[0].rule_type, RuleType::Primitive);
    }

    #[test]
    fn test_snapshot_file_round_trip() {
        let (store, p, s, _) = seeded();
        store.create_relation(NewRelation::new(s, p)).unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        store.save_to_file(&path, RuleScope::All).unwrap();

        let loaded = MemoryRuleStore::load_from_file(&path).unwrap();
        assert_eq!(loaded.rule_count(), 3);
        assert_eq!(loaded.relation_count(), 1);

        let (next, _) = loaded
            .create_rule(RuleType::Primitive, NewRule::new("fresh", "Fresh."))
            .unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn test_import_skip_existing() {
        let (store, ..) = seeded();
        let snapshot = store.export_snapshot(RuleScope::Only(RuleType::Primitive));
        let (stats, event) = store
            .import_snapshot(snapshot.clone(), MergeStrategy::SkipExisting)
            .unwrap();
        assert_eq!(stats.rules_skipped, 1);
        assert_eq!(stats.rules_imported, 0);
        assert_eq!(event, MutationEvent::Reloaded);

        let (stats, _) = store.import_snapshot(snapshot, MergeStrategy::Overwrite).unwrap();
        assert_eq!(stats.rules_imported, 1);
    }
}
