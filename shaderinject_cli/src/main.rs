mod disassemble;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use object::{Object, ObjectSection, SectionKind};
use shaderinject::{offsets::known_signatures, MemoryRegion, QueryState, SignatureRegistry};
use shaderinject_scanner::Pattern;

#[derive(Parser)]
enum Commands {
    Check(CommandCheck),
    Signatures(CommandSignatures),
}

#[derive(Parser)]
struct CommandCheck {
    /// An executable to check (can be specified multiple times)
    #[arg(required = true)]
    exe: Vec<PathBuf>,

    /// Only check this signature (can be specified multiple times). Checks every known
    /// signature if omitted
    #[arg(short, long)]
    signature: Vec<String>,

    /// Show disassembly for each match
    #[arg(short, long)]
    disassemble: bool,
}

#[derive(Parser)]
struct CommandSignatures {}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    match Commands::parse() {
        Commands::Check(command) => check(command),
        Commands::Signatures(command) => signatures(command),
    }
}

/// An executable laid out the way the loader maps it.
struct MappedImage {
    base: usize,
    data: Vec<u8>,
}

impl MappedImage {
    fn region(&self) -> MemoryRegion<'_> {
        MemoryRegion::with_base(self.base, &self.data)
    }
}

fn map_sections<'a>(base: u64, sections: impl IntoIterator<Item = (u64, &'a [u8])>) -> MappedImage {
    let mut data = vec![];
    for (address, bytes) in sections {
        let Some(offset) = address.checked_sub(base) else {
            continue;
        };
        let offset = offset as usize;
        if data.len() < offset + bytes.len() {
            data.resize(offset + bytes.len(), 0);
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    MappedImage {
        base: base as usize,
        data,
    }
}

fn load_image(path: &Path) -> Result<MappedImage> {
    let file = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let object = object::File::parse(&*file).with_context(|| format!("parsing {}", path.display()))?;

    let mut sections = vec![];
    for section in object.sections() {
        if matches!(
            section.kind(),
            SectionKind::UninitializedData | SectionKind::UninitializedTls | SectionKind::Metadata
        ) {
            continue;
        }
        let data = section
            .data()
            .with_context(|| format!("reading section {}", section.name().unwrap_or("?")))?;
        sections.push((section.address(), data));
    }
    let base = object.relative_address_base();
    tracing::debug!("{} sections, image base {base:#x}", sections.len());
    Ok(map_sections(base, sections))
}

fn selected_signatures(filter: &[String]) -> Result<Vec<(&'static str, Pattern)>> {
    let known = known_signatures();
    if let Some(unknown) = filter
        .iter()
        .find(|name| !known.iter().any(|(known, _)| known == name))
    {
        bail!("unknown signature {unknown:?}");
    }
    Ok(known
        .into_iter()
        .filter(|(name, _)| filter.is_empty() || filter.iter().any(|f| f == name))
        .collect())
}

fn check(command: CommandCheck) -> Result<()> {
    use colored::Colorize;
    use prettytable::{row, Cell, Row, Table};

    let selected = selected_signatures(&command.signature)?;
    let mut incomplete = vec![];

    for path in &command.exe {
        let image = load_image(path)?;
        let region = image.region();

        let mut registry = SignatureRegistry::new();
        let handles: Vec<_> = selected
            .iter()
            .map(|(name, pattern)| (registry.register(*name, pattern.clone()), pattern))
            .collect();
        let report = registry.resolve_all(&region);

        println!("{}", path.display());
        let mut table = Table::new();
        table.set_titles(row!["signature", "address", "rva"]);
        for (handle, pattern) in &handles {
            let cells = match handle.state() {
                QueryState::Resolved(address) => vec![
                    Cell::new(handle.name()),
                    Cell::new(&format!("{address:016x}").green().to_string()),
                    Cell::new(&format!("{:x}", address - image.base)),
                ],
                QueryState::Failed | QueryState::Unresolved => vec![
                    Cell::new(handle.name()),
                    Cell::new(&"not found".red().to_string()),
                    Cell::new(""),
                ],
            };
            table.add_row(Row::new(cells));

            if let (true, Some(address)) = (command.disassemble, handle.address()) {
                let offset = address - image.base;
                let data = &image.data[offset..(offset + 0x40).min(image.data.len())];
                println!(
                    "{}\n{}",
                    handle.name(),
                    disassemble::disassemble_match(address, data, pattern, 2)
                );
            }
        }
        table.printstd();

        if let Err(e) = report.ensure_complete() {
            println!("{}", e.to_string().red());
            incomplete.push(path.display().to_string());
        }
    }

    if !incomplete.is_empty() {
        bail!("signatures missing in {}", incomplete.join(", "));
    }
    Ok(())
}

fn signatures(_command: CommandSignatures) -> Result<()> {
    use prettytable::{row, Table};

    let mut table = Table::new();
    table.set_titles(row!["signature", "pattern"]);
    for (name, pattern) in known_signatures() {
        table.add_row(row![name, pattern]);
    }
    table.printstd();
    Ok(())
}
