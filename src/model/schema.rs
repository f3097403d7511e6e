//! Declarative tensor-name resolution.
//!
//! Model weights are bound to graph inputs by name. Checkpoints disagree on
//! naming, so each binding is a spec: a canonical path, alternatives, and
//! optional prefix/suffix composition. Resolution tries each candidate in
//! turn and takes the first name the lookup returns.

use super::ModelError;

/// One tensor binding.
#[derive(Debug, Clone, Default)]
pub struct TensorSpec {
    /// Canonical dotted path, e.g. `attn_q.weight`.
    pub name: String,

    /// Alternative paths tried after the canonical one.
    pub alternatives: Vec<String>,

    /// Prefix prepended to every candidate (e.g. `blk.5.`).
    pub prefix: String,

    /// Suffix appended to every candidate.
    pub suffix: String,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn alt(mut self, name: impl Into<String>) -> Self {
        self.alternatives.push(name.into());
        self
    }

    pub fn prefixed(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn suffixed(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Candidate names in resolution order.
    pub fn candidates(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(&self.name)
            .chain(self.alternatives.iter())
            .map(|n| format!("{}{}{}", self.prefix, n, self.suffix))
    }

    /// Resolve against a lookup, returning whatever the lookup yields for
    /// the first candidate it accepts.
    pub fn resolve<T>(&self, mut lookup: impl FnMut(&str) -> Option<T>) -> Option<T> {
        self.candidates().find_map(|name| lookup(&name))
    }

    /// Like [`resolve`](Self::resolve) but required: missing bindings are a
    /// model-construction error naming the canonical path.
    pub fn require<T>(
        &self,
        lookup: impl FnMut(&str) -> Option<T>,
    ) -> Result<T, ModelError> {
        self.resolve(lookup)
            .ok_or_else(|| ModelError::MissingTensor(format!("{}{}{}", self.prefix, self.name, self.suffix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table(names: &[&str]) -> HashMap<String, usize> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i))
            .collect()
    }

    #[test]
    fn test_canonical_preferred() {
        let t = table(&["blk.0.attn_q.weight", "blk.0.attn_query.weight"]);
        let spec = TensorSpec::new("attn_q.weight")
            .alt("attn_query.weight")
            .prefixed("blk.0.");
        assert_eq!(spec.resolve(|n| t.get(n).copied()), Some(0));
    }

    #[test]
    fn test_alternative_fallback() {
        let t = table(&["blk.0.attn_query.weight"]);
        let spec = TensorSpec::new("attn_q.weight")
            .alt("attn_query.weight")
            .prefixed("blk.0.");
        assert_eq!(spec.resolve(|n| t.get(n).copied()), Some(0));
    }

    #[test]
    fn test_missing_is_error() {
        let t = table(&[]);
        let spec = TensorSpec::new("output.weight").suffixed(".lora_a");
        let err = spec.require(|n| t.get(n).copied()).unwrap_err();
        assert!(err.to_string().contains("output.weight.lora_a"));
    }
}
