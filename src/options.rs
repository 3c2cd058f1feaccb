//! The pass's recognized configuration options (§6). Parsing these out of a
//! command line or config file belongs to the front end, which is an
//! external collaborator (§1); this crate only defines and consumes the
//! resulting flags.

use std::collections::HashSet;

/// Instrumentation category flags plus the user-supplied blacklist.
#[derive(Debug, Clone)]
pub struct Options {
    pub instrument_load: bool,
    pub instrument_store: bool,
    pub instrument_call: bool,
    pub instrument_stack: bool,
    pub instrument_bitcast: bool,
    pub emit_checks: bool,
    pub blacklist: HashSet<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            instrument_load: true,
            instrument_store: true,
            instrument_call: true,
            instrument_stack: true,
            instrument_bitcast: true,
            emit_checks: false,
            blacklist: HashSet::new(),
        }
    }
}

impl Options {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_instrument_load(mut self, enabled: bool) -> Self {
        self.instrument_load = enabled;
        self
    }

    #[must_use]
    pub fn with_instrument_store(mut self, enabled: bool) -> Self {
        self.instrument_store = enabled;
        self
    }

    #[must_use]
    pub fn with_instrument_call(mut self, enabled: bool) -> Self {
        self.instrument_call = enabled;
        self
    }

    #[must_use]
    pub fn with_instrument_stack(mut self, enabled: bool) -> Self {
        self.instrument_stack = enabled;
        self
    }

    #[must_use]
    pub fn with_instrument_bitcast(mut self, enabled: bool) -> Self {
        self.instrument_bitcast = enabled;
        self
    }

    #[must_use]
    pub fn with_emit_checks(mut self, enabled: bool) -> Self {
        self.emit_checks = enabled;
        self
    }

    #[must_use]
    pub fn with_blacklisted(mut self, name: impl Into<String>) -> Self {
        self.blacklist.insert(name.into());
        self
    }

    #[must_use]
    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist.contains(name)
    }
}
