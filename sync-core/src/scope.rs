use crate::errors::SyncError;
use crate::SyncResult;
use std::collections::{HashMap, HashSet};

/// A scope pattern is a template like `project:{project_id}`. Each `{param}`
/// segment binds to a literal value or a wildcard (`*`) in a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePattern {
    kind: String,
    params: Vec<String>,
}

impl ScopePattern {
    /// Parses `kind:{a}:{b}` into its kind and ordered parameter names.
    pub fn parse(pattern: &str) -> SyncResult<Self> {
        let mut segments = pattern.split(':');
        let kind = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::UnknownScope(pattern.to_string()))?
            .to_string();

        let mut params = Vec::new();
        for segment in segments {
            let name = segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(|| SyncError::UnknownScope(pattern.to_string()))?;
            params.push(name.to_string());
        }

        Ok(Self { kind, params })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Renders a concrete scope key by substituting bound parameter values.
    /// Returns `None` if a required binding is missing.
    pub fn bind(&self, bindings: &HashMap<String, String>) -> Option<String> {
        let mut key = self.kind.clone();
        for param in &self.params {
            let value = bindings.get(param)?;
            key.push(':');
            key.push_str(value);
        }
        Some(key)
    }
}

/// Matches rows against scope patterns and tracks a client's effective
/// scope set, the union of concrete scope keys across its subscriptions.
#[derive(Debug, Default)]
pub struct ScopeEngine {
    known_patterns: HashSet<String>,
    table_patterns: HashMap<String, Vec<ScopePattern>>,
}

impl ScopeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a scope pattern kind as resolvable. Subscriptions naming
    /// an unregistered kind are rejected at subscription time.
    pub fn register(&mut self, kind: impl Into<String>) {
        self.known_patterns.insert(kind.into());
    }

    /// Associates a scope pattern with a table: rows written to `table`
    /// will have their scope keys computed by binding the pattern's
    /// parameters against matching fields of the row payload.
    pub fn register_table_pattern(&mut self, table: impl Into<String>, pattern: ScopePattern) {
        self.known_patterns.insert(pattern.kind().to_string());
        self.table_patterns.entry(table.into()).or_default().push(pattern);
    }

    /// Computes the concrete scope keys a row belongs to by evaluating the
    /// table's registered patterns against its payload fields. A table
    /// with no registered patterns falls back to a single `table:<name>`
    /// scope so every row remains addressable.
    pub fn resolve_scope_keys(&self, table: &str, payload: Option<&serde_json::Value>) -> Vec<String> {
        let Some(patterns) = self.table_patterns.get(table) else {
            return vec![format!("table:{table}")];
        };

        let bindings: HashMap<String, String> = match payload.and_then(|v| v.as_object()) {
            Some(obj) => obj
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            None => HashMap::new(),
        };

        patterns.iter().filter_map(|pattern| pattern.bind(&bindings)).collect()
    }

    pub fn validate(&self, pattern: &ScopePattern) -> SyncResult<()> {
        if self.known_patterns.contains(pattern.kind()) {
            Ok(())
        } else {
            Err(SyncError::UnknownScope(pattern.kind().to_string()))
        }
    }

    /// A change is visible to a client iff its scope_keys intersect the
    /// client's effective scope set. Never widens scopes silently.
    pub fn is_visible(change_scope_keys: &[String], effective_scopes: &HashSet<String>) -> bool {
        change_scope_keys.iter().any(|key| effective_scopes.contains(key))
    }

    /// Union of concrete scope keys across a client's bound subscriptions.
    pub fn effective_scopes<'a>(bound_keys: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        bound_keys.into_iter().map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_param_pattern() {
        let pattern = ScopePattern::parse("project:{project_id}:{board_id}").unwrap();
        assert_eq!(pattern.kind(), "project");

        let mut bindings = HashMap::new();
        bindings.insert("project_id".to_string(), "acme".to_string());
        bindings.insert("board_id".to_string(), "42".to_string());
        assert_eq!(pattern.bind(&bindings).as_deref(), Some("project:acme:42"));
    }

    #[test]
    fn bind_fails_on_missing_param() {
        let pattern = ScopePattern::parse("project:{project_id}").unwrap();
        assert_eq!(pattern.bind(&HashMap::new()), None);
    }

    #[test]
    fn malformed_pattern_rejected() {
        assert!(ScopePattern::parse("project:project_id").is_err());
        assert!(ScopePattern::parse("").is_err());
    }

    #[test]
    fn visibility_requires_intersection() {
        let effective: HashSet<String> = ["project:acme".to_string()].into_iter().collect();
        assert!(ScopeEngine::is_visible(&["project:acme".to_string()], &effective));
        assert!(!ScopeEngine::is_visible(&["project:other".to_string()], &effective));
        assert!(!ScopeEngine::is_visible(&[], &effective));
    }

    #[test]
    fn unregistered_pattern_rejected_at_subscription_time() {
        let engine = ScopeEngine::new();
        let pattern = ScopePattern::parse("project:{project_id}").unwrap();
        assert!(matches!(engine.validate(&pattern), Err(SyncError::UnknownScope(_))));
    }

    #[test]
    fn registered_pattern_validates() {
        let mut engine = ScopeEngine::new();
        engine.register("project");
        let pattern = ScopePattern::parse("project:{project_id}").unwrap();
        assert!(engine.validate(&pattern).is_ok());
    }

    #[test]
    fn table_without_registered_pattern_falls_back_to_table_scope() {
        let engine = ScopeEngine::new();
        let keys = engine.resolve_scope_keys("widgets", None);
        assert_eq!(keys, vec!["table:widgets".to_string()]);
    }

    #[test]
    fn table_pattern_binds_from_payload() {
        let mut engine = ScopeEngine::new();
        engine.register_table_pattern("tasks", ScopePattern::parse("project:{project_id}").unwrap());
        let payload = serde_json::json!({"project_id": "acme", "title": "do it"});
        let keys = engine.resolve_scope_keys("tasks", Some(&payload));
        assert_eq!(keys, vec!["project:acme".to_string()]);
    }
}
