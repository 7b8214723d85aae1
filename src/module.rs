use crate::broker::HIERARCHY_CHAR;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, LazyLock, Mutex};

/// Attribute metadata reported to session clients.
#[derive(Debug, Clone)]
pub struct AttrInfo {
    pub name: String,
    pub ty: &'static str,
    pub count: usize,
}

/// Metadata of a module command.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    pub name: &'static str,
    pub argc: usize,
    pub desc: &'static str,
}

/// A named object in the platform hierarchy.
///
/// Session clients discover modules through the registry, read and write
/// their attributes by name, and invoke their commands. Devices implement
/// the subset they support; the defaults expose nothing.
pub trait Module: Send {
    /// Full hierarchical name, segments separated by `.`.
    fn name(&self) -> &str;

    /// Kind string shown in hierarchy listings.
    fn kind(&self) -> &'static str;

    fn attributes(&self) -> Vec<AttrInfo> {
        Vec::new()
    }

    /// Reads an attribute by its base name.
    fn read_attr(&self, _name: &str) -> Option<String> {
        None
    }

    /// Writes an attribute by its base name.
    fn write_attr(&mut self, name: &str, _value: &str) -> Result<(), String> {
        Err(format!("attribute '{name}' not writable"))
    }

    fn commands(&self) -> Vec<CommandInfo> {
        Vec::new()
    }

    /// Executes a module command, returning its output.
    fn execute(&mut self, cmd: &str, _args: &[&str]) -> Result<String, String> {
        Err(format!("command '{cmd}' not supported"))
    }
}

pub type SharedModule = Arc<Mutex<dyn Module>>;

#[derive(Default)]
struct Registry {
    objects: BTreeMap<String, SharedModule>,
    targets: Vec<String>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(Mutex::default);

/// Publishes a module in the process-wide registry.
pub fn register(module: SharedModule) {
    let name = module.lock().unwrap().name().to_owned();
    let mut registry = REGISTRY.lock().unwrap();

    if registry.objects.insert(name.clone(), module).is_some() {
        log::warn!("object '{name}' registered twice");
    }
}

pub fn unregister(name: &str) {
    REGISTRY.lock().unwrap().objects.remove(name);
}

pub fn find(name: &str) -> Option<SharedModule> {
    REGISTRY.lock().unwrap().objects.get(name).cloned()
}

/// Resolves a full attribute name `object.attr` to the owning module and
/// the attribute's base name. The object part is matched longest-first so
/// nested names work.
pub fn find_attribute(full: &str) -> Option<(SharedModule, String)> {
    let registry = REGISTRY.lock().unwrap();
    let mut name = full;

    while let Some(pos) = name.rfind(HIERARCHY_CHAR) {
        name = &name[..pos];

        if let Some(module) = registry.objects.get(name) {
            return Some((module.clone(), full[pos + 1..].to_owned()));
        }
    }

    None
}

/// Announces a named debug target for discovery via the session protocol.
pub fn register_target(name: impl Into<String>) {
    REGISTRY.lock().unwrap().targets.push(name.into());
}

pub fn targets() -> Vec<String> {
    REGISTRY.lock().unwrap().targets.clone()
}

/// Clears the registry. Intended for tests.
pub fn reset() {
    let mut registry = REGISTRY.lock().unwrap();

    registry.objects.clear();
    registry.targets.clear();
}

/// Escapes XML entities, then protocol commas.
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            ',' => out.push_str("\\,"),
            _ => out.push(c),
        }
    }

    out
}

/// Renders the registered object hierarchy as the XML document served by
/// the session protocol `l` command.
pub fn list_xml() -> String {
    let registry = REGISTRY.lock().unwrap();
    let names: Vec<String> = registry.objects.keys().cloned().collect();
    let mut out = String::from("<?xml version=\"1.0\" ?><hierarchy>");
    let mut pos = 0;

    while pos < names.len() {
        pos = list_object(&registry, &names, pos, &mut out);
    }

    for target in &registry.targets {
        let _ = write!(out, "<target>{}</target>", xml_escape(target));
    }

    out.push_str("</hierarchy>");
    out
}

/// Emits the object at `names[pos]` with its children nested inside, and
/// returns the index of the next sibling. Children are the objects whose
/// names extend this one by a hierarchy segment; the sorted name list
/// keeps them adjacent.
fn list_object(registry: &Registry, names: &[String], pos: usize, out: &mut String) -> usize {
    let name = &names[pos];
    let module = registry.objects[name].lock().unwrap();
    let basename = match name.rfind(HIERARCHY_CHAR) {
        Some(p) => &name[p + 1..],
        None => name,
    };

    let _ = write!(
        out,
        "<object name=\"{}\" kind=\"{}\">",
        xml_escape(basename),
        xml_escape(module.kind())
    );

    for attr in module.attributes() {
        let _ = write!(
            out,
            "<attribute name=\"{}\" type=\"{}\" count=\"{}\" />",
            xml_escape(&attr.name),
            xml_escape(attr.ty),
            attr.count
        );
    }

    for cmd in module.commands() {
        let _ = write!(
            out,
            "<command name=\"{}\" argc=\"{}\" desc=\"{}\" />",
            xml_escape(cmd.name),
            cmd.argc,
            xml_escape(cmd.desc)
        );
    }

    drop(module);

    let prefix = format!("{name}{HIERARCHY_CHAR}");
    let mut next = pos + 1;

    while next < names.len() && names[next].starts_with(&prefix) {
        next = list_object(registry, names, next, out);
    }

    out.push_str("</object>");
    next
}
