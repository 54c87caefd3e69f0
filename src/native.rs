//! Native function bridge (§4.6 `CALL` on a `NativeFn`, §6 `define_native`)
//! plus a registration surface for grouping natives under a namespace
//! before installing them into globals — the role the original source's
//! `library_runtime.c` plays for `math`/`string`/`io`/… (§C of
//! SPEC_FULL.md).

use crate::object::native_fn::NativeFn;

/// One native function awaiting registration: its global name and the
/// host callable the VM invokes with `(argc, argv)` (§6).
pub struct NativeEntry {
    pub name: &'static str,
    pub func: NativeFn,
}

/// Groups a set of native functions under a namespace, mirroring how the
/// original source's static registration tables list `{name, function}`
/// pairs for a whole library before a single loop calls `defineNative` for
/// each. An embedder builds one `NativeRegistry` per library and installs
/// it with [`crate::vm::Vm::register_library`].
pub struct NativeRegistry {
    pub namespace: Option<&'static str>,
    entries: Vec<NativeEntry>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry {
            namespace: None,
            entries: Vec::new(),
        }
    }

    /// Registers under `namespace.<name>` instead of bare `<name>` when
    /// installed (e.g. a `math` library's `sqrt` becomes global
    /// `math_sqrt`), matching the flattened-namespace convention natives
    /// already use in the original source's dotted-free global table.
    pub fn namespaced(namespace: &'static str) -> Self {
        NativeRegistry {
            namespace: Some(namespace),
            entries: Vec::new(),
        }
    }

    pub fn add(mut self, name: &'static str, func: NativeFn) -> Self {
        self.entries.push(NativeEntry { name, func });
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = &NativeEntry> {
        self.entries.iter()
    }

    pub fn qualified_name(&self, name: &str) -> String {
        match self.namespace {
            Some(ns) => format!("{ns}_{name}"),
            None => name.to_string(),
        }
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        NativeRegistry::new()
    }
}
