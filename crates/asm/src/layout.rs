use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::component::Component;
use crate::diag::Diagnostic;
use crate::span::{Span, Spanned};

/// A label definition attached to a position in the component list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDef {
    pub name: String,
    pub span: Span,
    /// Index of the component the label precedes. May equal the component
    /// count, marking the end of the module.
    pub component: usize,
}

/// Validated label set for one module, in definition order.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    entries: IndexMap<String, LabelEntry>,
}

#[derive(Debug, Clone)]
struct LabelEntry {
    span: Span,
    component: usize,
}

impl LabelTable {
    pub fn build(defs: &[LabelDef], component_count: usize) -> Result<Self, Vec<Diagnostic>> {
        let mut entries: IndexMap<String, LabelEntry> = IndexMap::new();
        let mut diagnostics = Vec::new();

        for def in defs {
            assert!(
                def.component <= component_count,
                "label '{}' points past the component list",
                def.name
            );

            if def.name.contains('.') {
                diagnostics.push(
                    Diagnostic::error(
                        def.span,
                        format!("label '{}' contains a reserved '.' character", def.name),
                    )
                    .with_note("dotted names refer to symbols in other modules"),
                );
                continue;
            }

            if def.name.starts_with('#') {
                diagnostics.push(Diagnostic::error(
                    def.span,
                    format!("label '{}' uses the reserved '#' prefix", def.name),
                ));
                continue;
            }

            match entries.get(&def.name) {
                Some(existing) => {
                    diagnostics.push(
                        Diagnostic::error(
                            def.span,
                            format!("label '{}' is defined more than once", def.name),
                        )
                        .with_label(existing.span, "first defined here"),
                    );
                }
                None => {
                    entries.insert(
                        def.name.clone(),
                        LabelEntry {
                            span: def.span,
                            component: def.component,
                        },
                    );
                }
            }
        }

        if diagnostics.is_empty() {
            Ok(Self { entries })
        } else {
            Err(diagnostics)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.component))
    }

    pub fn span_of(&self, name: &str) -> Option<Span> {
        self.entries.get(name).map(|entry| entry.span)
    }
}

/// Addresses assigned to one layout of the module, rebuilt every pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    /// Start address of each component, module-relative.
    pub starts: Vec<i64>,
    /// Address one past the last component.
    pub total: i64,
    /// Label name to assigned address.
    pub labels: FxHashMap<String, i64>,
}

pub fn build_address_map(components: &[Spanned<Component>], labels: &LabelTable) -> AddressMap {
    let mut starts = Vec::with_capacity(components.len());
    let mut cursor: i64 = 0;
    for component in components {
        starts.push(cursor);
        cursor += component.node.size() as i64;
    }

    let mut label_addresses = FxHashMap::default();
    for (name, index) in labels.iter() {
        let address = if index == components.len() {
            cursor
        } else {
            starts[index]
        };
        label_addresses.insert(name.to_string(), address);
    }

    AddressMap {
        starts,
        total: cursor,
        labels: label_addresses,
    }
}
