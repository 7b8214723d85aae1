use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// The hierarchy separator of object and property names.
pub const HIERARCHY_CHAR: char = '.';

/// A source of property initializers.
pub trait Broker: Send {
    fn name(&self) -> &str;

    /// Initializer for the property with the given full hierarchical name.
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Initializes properties from the process environment. The hierarchy
/// separator is replaced with `_` so `mem.size` reads `mem_size`.
pub struct EnvBroker;

impl Broker for EnvBroker {
    fn name(&self) -> &str {
        "environment"
    }

    fn lookup(&self, name: &str) -> Option<String> {
        let name = name.replace(HIERARCHY_CHAR, "_");

        std::env::var(name).ok()
    }
}

/// An in-memory broker for tests and programmatic configuration.
#[derive(Default)]
pub struct DictBroker {
    values: HashMap<String, String>,
}

impl DictBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

impl Broker for DictBroker {
    fn name(&self) -> &str {
        "dict"
    }

    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

static BROKERS: LazyLock<Mutex<Vec<Box<dyn Broker>>>> =
    LazyLock::new(|| Mutex::new(vec![Box::new(EnvBroker)]));

/// Registers a broker. Brokers added later take precedence.
pub fn register(broker: Box<dyn Broker>) {
    BROKERS.lock().unwrap().push(broker);
}

/// Looks up an initializer for `name`, newest broker first.
pub fn init(name: &str) -> Option<String> {
    let brokers = BROKERS.lock().unwrap();

    for broker in brokers.iter().rev() {
        if let Some(value) = broker.lookup(name) {
            log::debug!("property {name} initialized by {} broker", broker.name());
            return Some(value);
        }
    }

    None
}

/// Drops every broker except the environment one. Intended for tests.
pub fn reset() {
    let mut brokers = BROKERS.lock().unwrap();

    brokers.clear();
    brokers.push(Box::new(EnvBroker));
}
