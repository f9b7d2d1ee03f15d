use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "nst",
    version,
    about = "Toolchain for the NotSoTiny architecture",
    long_about = None,
    after_help = "Examples:\n  nst link main.nso util.nso -e main.start -o game.bin\n  nst link main.nso -T layout.nstld.ron --listing\n  nst dump main.nso\n  nst --help"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Link one or more relocatable object files into a flat binary.
    Link(LinkArgs),
    /// Print the tables and code of a relocatable object file.
    Dump(DumpArgs),
}

#[derive(Debug, Parser)]
struct LinkArgs {
    /// Input object files (.nso).
    #[arg(value_name = "OBJECT_FILE", required = true)]
    objects: Vec<PathBuf>,
    /// Linker config file in RON format.
    #[arg(short = 'T', long = "config", value_name = "CONFIG")]
    config: Option<PathBuf>,
    /// Entry point as `module.symbol`; overrides the config entry.
    #[arg(short = 'e', long = "entry", value_name = "ENTRY")]
    entry: Option<String>,
    /// Output binary path.
    #[arg(short = 'o', long = "output", value_name = "OUT_FILE")]
    output: Option<PathBuf>,
    /// Also write a listing file next to the output.
    #[arg(long = "listing")]
    listing: bool,
}

#[derive(Debug, Parser)]
struct DumpArgs {
    /// Input object file (.nso).
    #[arg(value_name = "OBJECT_FILE")]
    object: PathBuf,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Link(args)) => link_command(args),
        Some(Commands::Dump(args)) => dump_command(args),
        None => {
            print_banner();
            println!();
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn print_banner() {
    println!("NotSoTiny toolchain, version {}.", env!("CARGO_PKG_VERSION"));
    println!("Links and inspects nso relocatable objects.");
}

fn default_output_path(first_object: &Path) -> PathBuf {
    let stem = first_object
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("out");
    let parent = first_object.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}.bin"))
}

fn link_command(args: LinkArgs) -> anyhow::Result<()> {
    let mut objects = Vec::with_capacity(args.objects.len());
    for object_path in &args.objects {
        objects.push(nst_obj::read_object(object_path)?);
    }

    let config = if let Some(config_path) = &args.config {
        nst_link::load_config(config_path)?
    } else {
        nst_link::LinkerConfig::default()
    };
    let Some(entry) = args.entry.as_deref().or(config.entry.as_deref()) else {
        anyhow::bail!("entry symbol must be provided via -e or linker config entry");
    };

    let linked = nst_link::link_objects_with_config(&objects, entry, &config)?;

    let out_path = args
        .output
        .unwrap_or_else(|| default_output_path(&args.objects[0]));
    std::fs::write(&out_path, &linked.image)?;

    if args.listing {
        let listing_path = out_path.with_extension("lst");
        std::fs::write(listing_path, linked.listing(&config))?;
    }
    Ok(())
}

fn dump_command(args: DumpArgs) -> anyhow::Result<()> {
    let object = nst_obj::read_object(&args.object)?;

    println!("module {}", object.name);
    if let Some(source) = &object.source {
        println!("source {source}");
    }
    println!("code: {} bytes", object.code.len());

    println!("exports:");
    for (symbol, offset) in &object.outgoing {
        println!("  {offset:06X}: {symbol}");
    }
    if !object.incoming.is_empty() {
        println!("imports:");
        for (symbol, sites) in &object.incoming {
            let sites = sites
                .iter()
                .map(|site| format!("{site:06X}"))
                .collect::<Vec<_>>()
                .join(", ");
            println!("  {symbol} at {sites}");
        }
    }
    if !object.libraries.is_empty() {
        println!("libraries:");
        for (library, file) in &object.libraries {
            println!("  {library} -> {file}");
        }
    }

    println!("code:");
    print!("{}", disassemble(&object.code));
    Ok(())
}

/// Renders the code image one instruction per row. Bytes that do not
/// decode are shown as single data bytes so the dump always covers the
/// whole image.
fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    let mut offset = 0usize;
    while offset < code.len() {
        match nst_isa::decode_instruction(&code[offset..]) {
            Ok(decoded) => {
                let hex = code[offset..offset + decoded.size]
                    .iter()
                    .map(|byte| format!("{byte:02X}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                let text = nst_isa::format_instruction(&decoded, offset as u32);
                out.push_str(&format!("  {offset:06X}: {hex:<20} {text}\n"));
                offset += decoded.size;
            }
            Err(_) => {
                let byte = code[offset];
                out.push_str(&format!("  {offset:06X}: {byte:02X} {:<17} db {byte:#04X}\n", ""));
                offset += 1;
            }
        }
    }
    out
}
