use object::{
    pe::{ImageDosHeader, ImageNtHeaders64, IMAGE_DIRECTORY_ENTRY_IMPORT},
    read::pe::{Import, ImageNtHeaders, ImportTable},
    LittleEndian as LE,
};

/// Entry of a module's import table, by name or by ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportName {
    Name(String),
    Ordinal(u16),
}

impl std::fmt::Display for ImportName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportName::Name(name) => write!(f, "{name}"),
            ImportName::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

impl From<&str> for ImportName {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<u16> for ImportName {
    fn from(ordinal: u16) -> Self {
        Self::Ordinal(ordinal)
    }
}

/// Find the import address table slot holding `module!import` in a 64-bit PE image laid
/// out as it is in memory (section data at its RVA). Returns the slot's RVA.
///
/// Module and symbol names compare case-insensitively.
pub fn find_import_slot(
    image: &[u8],
    module: &str,
    import: &ImportName,
) -> object::read::Result<Option<u32>> {
    let dos_header = ImageDosHeader::parse(image)?;
    let mut offset = dos_header.nt_headers_offset().into();
    let (_, data_directories) = ImageNtHeaders64::parse(image, &mut offset)?;

    let Some(directory) = data_directories.get(IMAGE_DIRECTORY_ENTRY_IMPORT) else {
        return Ok(None);
    };
    let import_rva = directory.virtual_address.get(LE);
    if import_rva == 0 {
        return Ok(None);
    }

    let table = ImportTable::new(image, 0, import_rva);
    let mut descriptors = table.descriptors()?;
    while let Some(descriptor) = descriptors.next()? {
        let name = table.name(descriptor.name.get(LE))?;
        if !name.eq_ignore_ascii_case(module.as_bytes()) {
            continue;
        }

        let first_thunk = descriptor.first_thunk.get(LE);
        let lookup = match descriptor.original_first_thunk.get(LE) {
            0 => first_thunk,
            rva => rva,
        };

        let mut thunks = table.thunks(lookup)?;
        let mut index = 0u32;
        while let Some(thunk) = thunks.next::<ImageNtHeaders64>()? {
            let matches = match (table.import::<ImageNtHeaders64>(thunk)?, import) {
                (Import::Name(_, name), ImportName::Name(wanted)) => {
                    name.eq_ignore_ascii_case(wanted.as_bytes())
                }
                (Import::Ordinal(ordinal), ImportName::Ordinal(wanted)) => ordinal == *wanted,
                _ => false,
            };
            if matches {
                let slot_size = std::mem::size_of::<<ImageNtHeaders64 as ImageNtHeaders>::ImageThunkData>();
                return Ok(Some(first_thunk + index * slot_size as u32));
            }
            index += 1;
        }
    }
    Ok(None)
}
