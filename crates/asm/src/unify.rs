//! Namespace unification across assembled modules. Each module refers to the
//! others through provisional library names of its own choosing; unification
//! rewrites every reference to the canonical name of the module assembled
//! from the library's file, then optionally compacts all names to short
//! positional ids.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use thiserror::Error;

use nst_obj::{ORIGIN_SYMBOL, RelocatableObject, qualify, split_qualified};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnifyError {
    #[error("two modules share the name '{0}'")]
    DuplicateModule(String),
    #[error(
        "module '{module}' expects library '{library}' from '{file}', \
         but no module was assembled from that file"
    )]
    MissingLibrary {
        module: String,
        library: String,
        file: String,
    },
    #[error(
        "module '{module}' refers to '{symbol}' through library '{library}', \
         which it never declares"
    )]
    UndeclaredLibrary {
        module: String,
        library: String,
        symbol: String,
    },
    #[error("module '{module}' refers to '{symbol}', which nothing exports")]
    UndefinedSymbol { module: String, symbol: String },
    #[error("entry point '{0}' is not an exported 'module.symbol' name")]
    BadEntry(String),
}

/// A set of modules with a single consistent namespace, ready to link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub objects: Vec<RelocatableObject>,
    /// Qualified name of the symbol execution starts at.
    pub entry: String,
}

pub fn unify(mut objects: Vec<RelocatableObject>, entry: &str) -> Result<Program, UnifyError> {
    let mut by_name: FxHashMap<String, usize> = FxHashMap::default();
    let mut by_source: FxHashMap<String, String> = FxHashMap::default();
    for (index, object) in objects.iter().enumerate() {
        if by_name.insert(object.name.clone(), index).is_some() {
            return Err(UnifyError::DuplicateModule(object.name.clone()));
        }
        if let Some(source) = &object.source {
            by_source.insert(source.clone(), object.name.clone());
        }
    }

    for object in &mut objects {
        let mut rename: FxHashMap<String, String> = FxHashMap::default();
        let mut libraries = IndexMap::new();
        for (library, file) in &object.libraries {
            let canonical =
                by_source
                    .get(file)
                    .ok_or_else(|| UnifyError::MissingLibrary {
                        module: object.name.clone(),
                        library: library.clone(),
                        file: file.clone(),
                    })?;
            rename.insert(library.clone(), canonical.clone());
            libraries.insert(canonical.clone(), file.clone());
        }

        let mut incoming = IndexMap::new();
        for (symbol, sites) in std::mem::take(&mut object.incoming) {
            let (library, unqualified) = split_qualified(&symbol)
                .expect("incoming names validated as qualified on encode");
            // A decoded object can import through a module it never lists
            // as a library.
            let canonical = rename
                .get(library)
                .ok_or_else(|| UnifyError::UndeclaredLibrary {
                    module: object.name.clone(),
                    library: library.to_string(),
                    symbol: symbol.clone(),
                })?;
            let renamed = qualify(canonical, unqualified);
            incoming
                .entry(renamed)
                .or_insert_with(Vec::new)
                .extend(sites);
        }
        object.incoming = incoming;
        object.libraries = libraries;
    }

    for object in &objects {
        for symbol in object.incoming.keys() {
            let (module, unqualified) =
                split_qualified(symbol).expect("unified names are qualified");
            let exported = by_name
                .get(module)
                .map(|index| &objects[*index])
                .is_some_and(|target| target.outgoing.contains_key(unqualified));
            if !exported {
                return Err(UnifyError::UndefinedSymbol {
                    module: object.name.clone(),
                    symbol: symbol.clone(),
                });
            }
        }
    }

    let entry_exported = split_qualified(entry).is_some_and(|(module, symbol)| {
        by_name
            .get(module)
            .map(|index| &objects[*index])
            .is_some_and(|target| target.outgoing.contains_key(symbol))
    });
    if !entry_exported {
        return Err(UnifyError::BadEntry(entry.to_string()));
    }

    Ok(Program {
        objects,
        entry: entry.to_string(),
    })
}

/// Renames modules and symbols to positional ids, shrinking the name tables.
/// `#origin` keeps its name; everything that refers to a renamed symbol,
/// including the entry point, is rewritten.
pub fn compact(program: &mut Program) {
    let mut module_rename: FxHashMap<String, String> = FxHashMap::default();
    let mut symbol_rename: FxHashMap<String, FxHashMap<String, String>> = FxHashMap::default();

    for (index, object) in program.objects.iter().enumerate() {
        module_rename.insert(object.name.clone(), index.to_string());
        let mut symbols = FxHashMap::default();
        let mut next = 0usize;
        for symbol in object.outgoing.keys() {
            if symbol == ORIGIN_SYMBOL {
                continue;
            }
            symbols.insert(symbol.clone(), next.to_string());
            next += 1;
        }
        symbol_rename.insert(object.name.clone(), symbols);
    }

    let rename_symbol = |module: &str, symbol: &str| -> String {
        if symbol == ORIGIN_SYMBOL {
            return symbol.to_string();
        }
        symbol_rename[module][symbol].clone()
    };

    let (entry_module, entry_symbol) =
        split_qualified(&program.entry).expect("entry validated during unification");
    program.entry = qualify(
        &module_rename[entry_module],
        &rename_symbol(entry_module, entry_symbol),
    );

    for object in &mut program.objects {
        let new_name = module_rename[&object.name].clone();
        let old_name = std::mem::replace(&mut object.name, new_name);

        let outgoing = std::mem::take(&mut object.outgoing);
        object.outgoing = outgoing
            .into_iter()
            .map(|(symbol, offset)| (rename_symbol(&old_name, &symbol), offset))
            .collect();

        let incoming = std::mem::take(&mut object.incoming);
        object.incoming = incoming
            .into_iter()
            .map(|(symbol, sites)| {
                let (module, unqualified) =
                    split_qualified(&symbol).expect("unified names are qualified");
                let renamed = qualify(&module_rename[module], &rename_symbol(module, unqualified));
                (renamed, sites)
            })
            .collect();

        let libraries = std::mem::take(&mut object.libraries);
        object.libraries = libraries
            .into_iter()
            .map(|(module, file)| (module_rename[&module].clone(), file))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(
        name: &str,
        source: &str,
        exports: &[(&str, u32)],
        imports: &[(&str, &[u32])],
        libraries: &[(&str, &str)],
    ) -> RelocatableObject {
        let mut outgoing = IndexMap::new();
        outgoing.insert(ORIGIN_SYMBOL.to_string(), 0);
        for (symbol, offset) in exports {
            outgoing.insert(symbol.to_string(), *offset);
        }
        let mut incoming = IndexMap::new();
        for (symbol, sites) in imports {
            incoming.insert(symbol.to_string(), sites.to_vec());
        }
        let mut library_table = IndexMap::new();
        for (library, file) in libraries {
            library_table.insert(library.to_string(), file.to_string());
        }
        RelocatableObject {
            name: name.to_string(),
            source: Some(source.to_string()),
            code: vec![0; 16],
            outgoing,
            incoming,
            libraries: library_table,
        }
    }

    #[test]
    fn renames_provisional_libraries_to_canonical_modules() {
        let main = object(
            "main",
            "main.asm",
            &[("start", 0)],
            &[("u.helper", &[4])],
            &[("u", "util.asm")],
        );
        let util = object("util", "util.asm", &[("helper", 8)], &[], &[]);

        let program = unify(vec![main, util], "main.start").expect("unify");
        let main = &program.objects[0];
        assert_eq!(main.incoming["util.helper"], vec![4]);
        assert_eq!(main.libraries["util"], "util.asm");
        assert!(!main.incoming.contains_key("u.helper"));
    }

    #[test]
    fn merges_aliased_libraries_for_the_same_file() {
        let main = object(
            "main",
            "main.asm",
            &[("start", 0)],
            &[("a.helper", &[0]), ("b.helper", &[8])],
            &[("a", "util.asm"), ("b", "util.asm")],
        );
        let util = object("util", "util.asm", &[("helper", 8)], &[], &[]);

        let program = unify(vec![main, util], "main.start").expect("unify");
        assert_eq!(program.objects[0].incoming["util.helper"], vec![0, 8]);
    }

    #[test]
    fn missing_library_file_is_an_error() {
        let main = object(
            "main",
            "main.asm",
            &[("start", 0)],
            &[("u.helper", &[4])],
            &[("u", "nonexistent.asm")],
        );
        let err = unify(vec![main], "main.start").expect_err("must fail");
        assert_eq!(
            err,
            UnifyError::MissingLibrary {
                module: "main".to_string(),
                library: "u".to_string(),
                file: "nonexistent.asm".to_string(),
            }
        );
    }

    #[test]
    fn undeclared_library_in_incoming_name_is_an_error() {
        // A well-formed object file can still import through a module it
        // never listed as a library; unification must refuse it, not panic.
        let main = object(
            "main",
            "main.asm",
            &[("start", 0)],
            &[("ghost.helper", &[4])],
            &[],
        );
        let err = unify(vec![main], "main.start").expect_err("must fail");
        assert_eq!(
            err,
            UnifyError::UndeclaredLibrary {
                module: "main".to_string(),
                library: "ghost".to_string(),
                symbol: "ghost.helper".to_string(),
            }
        );
    }

    #[test]
    fn undefined_symbol_is_an_error() {
        let main = object(
            "main",
            "main.asm",
            &[("start", 0)],
            &[("u.absent", &[4])],
            &[("u", "util.asm")],
        );
        let util = object("util", "util.asm", &[("helper", 8)], &[], &[]);
        let err = unify(vec![main, util], "main.start").expect_err("must fail");
        assert!(matches!(err, UnifyError::UndefinedSymbol { .. }));
    }

    #[test]
    fn rejects_unknown_entry_point() {
        let main = object("main", "main.asm", &[("start", 0)], &[], &[]);
        let err = unify(vec![main], "main.missing").expect_err("must fail");
        assert_eq!(err, UnifyError::BadEntry("main.missing".to_string()));
    }

    #[test]
    fn compaction_assigns_positional_ids_and_keeps_origin() {
        let main = object(
            "main",
            "main.asm",
            &[("start", 0), ("loop", 4)],
            &[("u.helper", &[8]), ("u.#origin", &[12])],
            &[("u", "util.asm")],
        );
        let util = object("util", "util.asm", &[("helper", 8)], &[], &[]);

        let mut program = unify(vec![main, util], "main.loop").expect("unify");
        compact(&mut program);

        assert_eq!(program.entry, "0.1");
        let main = &program.objects[0];
        assert_eq!(main.name, "0");
        assert_eq!(main.outgoing[ORIGIN_SYMBOL], 0);
        assert_eq!(main.outgoing["0"], 0);
        assert_eq!(main.outgoing["1"], 4);
        assert_eq!(main.incoming["1.0"], vec![8]);
        assert_eq!(main.incoming["1.#origin"], vec![12]);
        assert_eq!(main.libraries["1"], "util.asm");
        assert_eq!(program.objects[1].name, "1");
    }
}
