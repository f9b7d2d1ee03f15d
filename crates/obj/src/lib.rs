use anyhow::{Context, Result, bail};
use indexmap::IndexMap;

const NSO_MAGIC: &[u8; 5] = b"\x01\x00nso";
const PAYLOAD_VERSION: u16 = 1;

/// Width in bytes of every relocation patch site.
pub const PATCH_WIDTH: u32 = 4;

/// Synthetic symbol every object exports at offset zero, marking the start of
/// its code image. Compaction renames every symbol except this one.
pub const ORIGIN_SYMBOL: &str = "#origin";

/// A fully resolved module, ready to be linked. Addresses are offsets into
/// `code`; placement happens at link time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocatableObject {
    /// Module name other objects refer to this one by.
    pub name: String,
    /// Source file the module was assembled from, if known.
    pub source: Option<String>,
    pub code: Vec<u8>,
    /// Exported symbols: unqualified name to offset in `code`.
    pub outgoing: IndexMap<String, u32>,
    /// Imported symbols: qualified `module.symbol` name to the offsets of the
    /// 4-byte fields the linker must patch with its final address.
    pub incoming: IndexMap<String, Vec<u32>>,
    /// Referenced libraries: the name used in `incoming` keys to the file the
    /// module is expected to come from.
    pub libraries: IndexMap<String, String>,
}

/// Builds a `module.symbol` qualified name.
pub fn qualify(module: &str, symbol: &str) -> String {
    format!("{module}.{symbol}")
}

/// Splits a qualified name at its first dot.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once('.')
}

pub fn write_object(path: &std::path::Path, object: &RelocatableObject) -> Result<()> {
    let bytes = encode_object(object)?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write '{}'", path.display()))
}

pub fn read_object(path: &std::path::Path) -> Result<RelocatableObject> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    decode_object(&bytes).with_context(|| format!("failed to decode '{}'", path.display()))
}

pub fn encode_object(object: &RelocatableObject) -> Result<Vec<u8>> {
    validate_object(object)?;

    let mut out = Vec::with_capacity(64 + object.code.len());
    out.extend_from_slice(NSO_MAGIC);
    write_u16(&mut out, PAYLOAD_VERSION);

    write_string(&mut out, &object.name)?;
    match &object.source {
        Some(source) => {
            out.push(1);
            write_string(&mut out, source)?;
        }
        None => out.push(0),
    }
    write_bytes(&mut out, &object.code)?;

    write_u32(&mut out, object.outgoing.len() as u32);
    for (symbol, offset) in &object.outgoing {
        write_string(&mut out, symbol)?;
        write_u32(&mut out, *offset);
    }

    write_u32(&mut out, object.incoming.len() as u32);
    for (symbol, sites) in &object.incoming {
        write_string(&mut out, symbol)?;
        write_u32(&mut out, sites.len() as u32);
        for site in sites {
            write_u32(&mut out, *site);
        }
    }

    write_u32(&mut out, object.libraries.len() as u32);
    for (name, file) in &object.libraries {
        write_string(&mut out, name)?;
        write_string(&mut out, file)?;
    }

    Ok(out)
}

pub fn decode_object(bytes: &[u8]) -> Result<RelocatableObject> {
    let mut rd = Reader::new(bytes);
    let magic = rd.read_exact(5)?;
    if magic != NSO_MAGIC {
        bail!("invalid object magic");
    }

    let version = rd.read_u16()?;
    if !(1..=PAYLOAD_VERSION).contains(&version) {
        bail!("unsupported object version: {version}");
    }

    let name = rd.read_string()?;
    let source = if rd.read_u8()? != 0 {
        Some(rd.read_string()?)
    } else {
        None
    };
    let code = rd.read_bytes()?;

    let outgoing_count = rd.read_u32()? as usize;
    let mut outgoing = IndexMap::with_capacity(outgoing_count);
    for _ in 0..outgoing_count {
        let symbol = rd.read_string()?;
        let offset = rd.read_u32()?;
        if outgoing.insert(symbol.clone(), offset).is_some() {
            bail!("duplicate exported symbol '{symbol}'");
        }
    }

    let incoming_count = rd.read_u32()? as usize;
    let mut incoming = IndexMap::with_capacity(incoming_count);
    for _ in 0..incoming_count {
        let symbol = rd.read_string()?;
        let site_count = rd.read_u32()? as usize;
        let mut sites = Vec::with_capacity(site_count);
        for _ in 0..site_count {
            sites.push(rd.read_u32()?);
        }
        if incoming.insert(symbol.clone(), sites).is_some() {
            bail!("duplicate imported symbol '{symbol}'");
        }
    }

    let library_count = rd.read_u32()? as usize;
    let mut libraries = IndexMap::with_capacity(library_count);
    for _ in 0..library_count {
        let library = rd.read_string()?;
        let file = rd.read_string()?;
        if libraries.insert(library.clone(), file).is_some() {
            bail!("duplicate library reference '{library}'");
        }
    }

    if !rd.is_eof() {
        bail!("object has trailing bytes");
    }

    let object = RelocatableObject {
        name,
        source,
        code,
        outgoing,
        incoming,
        libraries,
    };
    validate_object(&object)?;
    Ok(object)
}

pub fn validate_object(object: &RelocatableObject) -> Result<()> {
    if object.name.is_empty() {
        bail!("object has an empty module name");
    }

    let code_len: u32 = object
        .code
        .len()
        .try_into()
        .context("code image length does not fit in u32")?;

    for (symbol, offset) in &object.outgoing {
        if symbol.is_empty() {
            bail!("object exports a symbol with an empty name");
        }
        // Exports may point one past the end, marking the image's end.
        if *offset > code_len {
            bail!(
                "exported symbol '{symbol}' offset {offset:#X} is outside the code image"
            );
        }
    }

    for (symbol, sites) in &object.incoming {
        let Some((module, unqualified)) = split_qualified(symbol) else {
            bail!("imported symbol '{symbol}' is not a qualified 'module.symbol' name");
        };
        if module.is_empty() || unqualified.is_empty() {
            bail!("imported symbol '{symbol}' has an empty module or symbol part");
        }
        for site in sites {
            if site.checked_add(PATCH_WIDTH).map_or(true, |end| end > code_len) {
                bail!("patch site {site:#X} for '{symbol}' is outside the code image");
            }
        }
    }

    for (library, file) in &object.libraries {
        if library.is_empty() || file.is_empty() {
            bail!("object has a library reference with an empty name or file");
        }
    }

    Ok(())
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    let len: u32 = bytes
        .len()
        .try_into()
        .context("string too long for object encoding")?;
    write_u32(out, len);
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_bytes(out: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    let len: u32 = value
        .len()
        .try_into()
        .context("byte array too long for object encoding")?;
    write_u32(out, len);
    out.extend_from_slice(value);
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.read_exact(1)?;
        Ok(bytes[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_exact(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        let value = std::str::from_utf8(&bytes).context("invalid utf-8 in object")?;
        Ok(value.to_string())
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.read_exact(len)?.to_vec())
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.saturating_add(len);
        if end > self.bytes.len() {
            bail!("unexpected EOF");
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn is_eof(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
