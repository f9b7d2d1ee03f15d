//! Linker for NotSoTiny relocatable objects.
//!
//! Places each object's code image sequentially in a flat output image,
//! assigns every exported symbol an absolute address, and patches the
//! 4-byte incoming reference sites recorded by the assembler. The result
//! is a raw binary plus the resolved entry point address.

use std::path::Path;

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use nst_obj::{PATCH_WIDTH, RelocatableObject, qualify};
use serde::Deserialize;

/// Linker settings, loaded from a RON file or built in code.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LinkerConfig {
    /// Address of the first byte of the output image.
    #[serde(default)]
    pub base: u32,
    /// Each object image starts at a multiple of this. Must be a power of two.
    #[serde(default = "default_align")]
    pub align: u32,
    /// Byte used for alignment padding between objects.
    #[serde(default)]
    pub fill: u8,
    /// Entry point as a qualified `module.symbol` name. A value given on
    /// the command line takes precedence over this.
    #[serde(default)]
    pub entry: Option<String>,
}

fn default_align() -> u32 {
    1
}

impl Default for LinkerConfig {
    fn default() -> Self {
        LinkerConfig {
            base: 0,
            align: default_align(),
            fill: 0,
            entry: None,
        }
    }
}

/// Parses a [`LinkerConfig`] from RON text.
pub fn parse_config(text: &str) -> Result<LinkerConfig> {
    let config: LinkerConfig =
        ron::from_str(text).context("failed to parse linker configuration")?;
    Ok(config)
}

/// Reads and parses a linker configuration file.
pub fn load_config(path: &Path) -> Result<LinkerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read linker config {}", path.display()))?;
    parse_config(&text).with_context(|| format!("in {}", path.display()))
}

/// Where a module's image landed in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub address: u32,
    pub size: u32,
}

/// Result of a successful link.
#[derive(Debug, Clone)]
pub struct LinkOutput {
    /// The flat image, starting at the configured base address.
    pub image: Vec<u8>,
    /// Absolute address of the entry symbol.
    pub entry_address: u32,
    /// Module name to placement, in link order.
    pub placements: IndexMap<String, Placement>,
    /// Qualified symbol name to absolute address, in definition order.
    pub symbols: IndexMap<String, u32>,
}

/// Links objects into a flat image using the default configuration.
pub fn link_objects(objects: &[RelocatableObject], entry: &str) -> Result<LinkOutput> {
    link_objects_with_config(objects, entry, &LinkerConfig::default())
}

/// Links objects into a flat image.
///
/// Objects are placed in the order given, starting at `config.base` and
/// aligned to `config.align`. Every incoming reference site is patched
/// with the 4-byte little-endian absolute address of the named symbol.
pub fn link_objects_with_config(
    objects: &[RelocatableObject],
    entry: &str,
    config: &LinkerConfig,
) -> Result<LinkOutput> {
    if objects.is_empty() {
        bail!("nothing to link");
    }
    if config.align == 0 || !config.align.is_power_of_two() {
        bail!("alignment {} is not a power of two", config.align);
    }

    // First pass assigns every module a slot in the image.
    let mut placements: IndexMap<String, Placement> = IndexMap::new();
    let mut cursor = u64::from(config.base);
    for object in objects {
        cursor = align_up(cursor, u64::from(config.align));
        let size = object.code.len() as u64;
        if cursor + size > u64::from(u32::MAX) + 1 {
            bail!(
                "module '{}' does not fit below the 4 GiB address limit",
                object.name
            );
        }
        let placement = Placement {
            address: cursor as u32,
            size: size as u32,
        };
        if placements.insert(object.name.clone(), placement).is_some() {
            bail!("module '{}' is linked more than once", object.name);
        }
        cursor += size;
    }

    // Symbol table over all exports, keyed by qualified name.
    let mut symbols: IndexMap<String, u32> = IndexMap::new();
    for object in objects {
        let base = placements[&object.name].address;
        for (symbol, &offset) in &object.outgoing {
            symbols.insert(qualify(&object.name, symbol), base + offset);
        }
    }

    // Lay out the image, then patch reference sites in place.
    let total = (cursor - u64::from(config.base)) as usize;
    let mut image = vec![config.fill; total];
    for object in objects {
        let placement = placements[&object.name];
        let start = (placement.address - config.base) as usize;
        image[start..start + object.code.len()].copy_from_slice(&object.code);
    }

    for object in objects {
        let start = (placements[&object.name].address - config.base) as usize;
        for (symbol, sites) in &object.incoming {
            let Some(&address) = symbols.get(symbol.as_str()) else {
                bail!(
                    "module '{}' refers to undefined symbol '{}'",
                    object.name,
                    symbol
                );
            };
            for &site in sites {
                let at = start + site as usize;
                image[at..at + PATCH_WIDTH as usize].copy_from_slice(&address.to_le_bytes());
            }
        }
    }

    let Some(&entry_address) = symbols.get(entry) else {
        bail!("entry symbol '{entry}' is not defined by any module");
    };

    Ok(LinkOutput {
        image,
        entry_address,
        placements,
        symbols,
    })
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

impl LinkOutput {
    /// Renders a map of the linked image: placements, symbols, and a hex
    /// dump of each module's bytes.
    pub fn listing(&self, config: &LinkerConfig) -> String {
        let mut out = String::new();
        out.push_str(&format!("entry: {:08X}\n", self.entry_address));
        for (module, placement) in &self.placements {
            out.push_str(&format!(
                "\nmodule {module} at {:06X} ({} bytes)\n",
                placement.address, placement.size
            ));
            for (symbol, &address) in &self.symbols {
                let Some(rest) = symbol.strip_prefix(module.as_str()) else {
                    continue;
                };
                let Some(name) = rest.strip_prefix('.') else {
                    continue;
                };
                out.push_str(&format!("  {address:06X}: {name}\n"));
            }
            let start = (placement.address - config.base) as usize;
            let bytes = &self.image[start..start + placement.size as usize];
            for (row, chunk) in bytes.chunks(16).enumerate() {
                let hex = chunk
                    .iter()
                    .map(|byte| format!("{byte:02X}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                let address = placement.address as usize + row * 16;
                out.push_str(&format!("  {address:06X}: {hex}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nst_obj::ORIGIN_SYMBOL;

    fn object(name: &str, code: Vec<u8>) -> RelocatableObject {
        let mut object = RelocatableObject {
            name: name.to_owned(),
            code,
            ..Default::default()
        };
        object.outgoing.insert(ORIGIN_SYMBOL.to_owned(), 0);
        object
    }

    #[test]
    fn places_and_patches_two_modules() {
        // main: call util.helper; hlt
        let mut main = object("main", vec![0x77, 0, 0, 0, 0, 0x01]);
        main.outgoing.insert("start".to_owned(), 0);
        main.incoming.insert("util.helper".to_owned(), vec![1]);
        main.libraries
            .insert("util".to_owned(), "util.nst".to_owned());

        // util: nop; ret (helper at offset 1)
        let mut util = object("util", vec![0x00, 0x79]);
        util.outgoing.insert("helper".to_owned(), 1);

        let output = link_objects(&[main, util], "main.start").unwrap();
        assert_eq!(output.entry_address, 0);
        assert_eq!(output.placements["util"].address, 6);
        assert_eq!(output.symbols["util.helper"], 7);
        // Patched call target is 7, little endian.
        assert_eq!(output.image, vec![0x77, 7, 0, 0, 0, 0x01, 0x00, 0x79]);
    }

    #[test]
    fn respects_base_and_alignment() {
        let first = object("a", vec![0x00; 3]);
        let second = object("b", vec![0x79]);
        let config = LinkerConfig {
            base: 0x100,
            align: 8,
            fill: 0xEE,
            entry: None,
        };
        let output = link_objects_with_config(&[first, second], "a.#origin", &config).unwrap();
        assert_eq!(output.placements["a"].address, 0x100);
        assert_eq!(output.placements["b"].address, 0x108);
        assert_eq!(output.image.len(), 9);
        // Padding between the modules uses the fill byte.
        assert_eq!(&output.image[3..8], &[0xEE; 5]);
        assert_eq!(output.entry_address, 0x100);
    }

    #[test]
    fn rejects_undefined_symbols() {
        let mut main = object("main", vec![0x77, 0, 0, 0, 0]);
        main.incoming.insert("util.helper".to_owned(), vec![1]);
        let error = link_objects(&[main], "main.#origin").unwrap_err();
        assert!(error.to_string().contains("undefined symbol 'util.helper'"));
    }

    #[test]
    fn rejects_duplicate_modules() {
        let objects = [object("main", vec![0x00]), object("main", vec![0x01])];
        let error = link_objects(&objects, "main.#origin").unwrap_err();
        assert!(error.to_string().contains("linked more than once"));
    }

    #[test]
    fn rejects_missing_entry() {
        let main = object("main", vec![0x00]);
        let error = link_objects(&[main], "main.start").unwrap_err();
        assert!(error.to_string().contains("entry symbol 'main.start'"));
    }

    #[test]
    fn parses_config_from_ron() {
        let config = parse_config(
            r#"(
                base: 0x1000,
                align: 16,
                entry: Some("main.start"),
            )"#,
        )
        .unwrap();
        assert_eq!(config.base, 0x1000);
        assert_eq!(config.align, 16);
        assert_eq!(config.fill, 0);
        assert_eq!(config.entry.as_deref(), Some("main.start"));

        let error = parse_config("(bogus: 1)").unwrap_err();
        assert!(error.to_string().contains("linker configuration"));
    }

    #[test]
    fn listing_shows_symbols_and_bytes() {
        let mut main = object("main", vec![0x00, 0x79]);
        main.outgoing.insert("start".to_owned(), 0);
        let output = link_objects(&[main], "main.start").unwrap();
        let listing = output.listing(&LinkerConfig::default());
        assert!(listing.contains("module main at 000000"));
        assert!(listing.contains("000000: start"));
        assert!(listing.contains("  000000: 00 79"));
    }
}
