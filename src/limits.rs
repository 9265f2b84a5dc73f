//! Configuration selection: an ordered list of named configurations, each
//! guarded by a predicate, tried in declaration order.

use tracing::debug;

use crate::executor::ValueMap;

/// Policy deciding which of a service's configurations handles a given
/// input set.
///
/// Implementations declare their configuration names in the order the
/// predicates should be tried. `setup` runs before any predicate and exists
/// for lazy resource acquisition; it must be idempotent.
pub trait JobLimits: Send {
    /// Configuration names in evaluation order.
    fn configurations(&self) -> Vec<String>;

    /// Whether `configuration` accepts the input set.
    fn accepts(&self, configuration: &str, fields: &ValueMap) -> bool;

    fn setup(&mut self) {}

    /// First configuration whose predicate accepts `fields`, or `None` when
    /// none does.
    fn select(&mut self, fields: &ValueMap) -> Option<String> {
        self.setup();
        let selected = self
            .configurations()
            .into_iter()
            .find(|conf| self.accepts(conf, fields));
        debug!(configuration = ?selected, "limits selection");
        selected
    }
}

/// Permissive policy backing the `"default"` registry key: every input set
/// lands in the first declared configuration.
pub struct DefaultLimits {
    configurations: Vec<String>,
}

impl DefaultLimits {
    pub fn new(configurations: Vec<String>) -> Self {
        DefaultLimits { configurations }
    }
}

impl JobLimits for DefaultLimits {
    fn configurations(&self) -> Vec<String> {
        self.configurations.clone()
    }

    fn accepts(&self, _configuration: &str, _fields: &ValueMap) -> bool {
        true
    }
}
