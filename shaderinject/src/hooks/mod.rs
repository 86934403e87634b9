//! All-or-nothing installation of code hooks.
//!
//! Requests are collected in a [`Transaction`] and written by [`Transaction::commit`].
//! A commit either applies every request or leaves memory as it found it.

pub mod imports;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod native;
pub mod stub;

use std::{
    marker::PhantomData,
    sync::{Arc, OnceLock},
};

use crate::{image::MemoryRegion, signatures::QueryHandle};
pub use imports::ImportName;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook target {name} is unresolved")]
    UnresolvedTarget { name: String },
    #[error("import {module}!{import} not found")]
    ImportNotFound { module: String, import: String },
    #[error("failed to read import table: {0}")]
    ImportTable(#[from] object::read::Error),
    #[error("memory at {address:#x} is not accessible")]
    Memory { address: usize },
    #[error("failed to change protection at {address:#x}: {reason}")]
    Protect { address: usize, reason: String },
    #[error("detour at {target:#x} failed: {reason}")]
    Detour { target: usize, reason: String },
    #[error("failed to assemble stub: {0}")]
    Assemble(#[from] iced_x86::IcedError),
    #[error("failed to allocate {size} bytes of executable memory")]
    Allocation { size: usize },
}

/// Platform access needed to place hooks. Every method works on raw addresses.
pub trait CodeWriter: Send + Sync {
    /// Build an inline detour from `target` to `replacement` without writing it yet.
    ///
    /// # Safety
    /// `target` must be the start of an instruction in executable memory.
    unsafe fn prepare_detour(
        &self,
        target: usize,
        replacement: usize,
    ) -> Result<Box<dyn InlineDetour>, HookError>;

    /// # Safety
    /// `address..address + len` must be mapped.
    unsafe fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, HookError>;

    /// Overwrite code or data, lifting page protection for the duration of the write.
    ///
    /// # Safety
    /// Nothing may execute or read the bytes being written.
    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), HookError>;
}

/// A prepared jump patch that can be toggled.
pub trait InlineDetour: Send + Sync {
    fn enable(&mut self) -> Result<(), HookError>;
    fn disable(&mut self) -> Result<(), HookError>;
    /// Entry point that runs the displaced instructions and continues in the original code.
    fn trampoline(&self) -> usize;
}

/// Anything that names a hook target address.
pub trait HookTarget {
    fn resolve(&self) -> Option<usize>;
    fn describe(&self) -> String;
}

impl HookTarget for usize {
    fn resolve(&self) -> Option<usize> {
        (*self != 0).then_some(*self)
    }
    fn describe(&self) -> String {
        format!("{self:#x}")
    }
}

impl HookTarget for QueryHandle {
    fn resolve(&self) -> Option<usize> {
        self.address()
    }
    fn describe(&self) -> String {
        self.name().to_string()
    }
}

impl<T: HookTarget + ?Sized> HookTarget for &T {
    fn resolve(&self) -> Option<usize> {
        (**self).resolve()
    }
    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Address of a function pointer.
pub fn fn_address<F: Copy>(f: F) -> usize {
    const { assert!(std::mem::size_of::<F>() == std::mem::size_of::<usize>()) };
    // SAFETY: `F` is pointer sized
    unsafe { std::mem::transmute_copy(&f) }
}

/// Capability to call the code a hook replaced. Empty until the hook's transaction commits.
pub struct Original<F> {
    slot: Arc<OnceLock<usize>>,
    _marker: PhantomData<fn() -> F>,
}

impl<F> Clone for Original<F> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _marker: PhantomData,
        }
    }
}

impl<F> std::fmt::Debug for Original<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.slot.get() {
            Some(address) => write!(f, "Original({address:#x})"),
            None => write!(f, "Original(<pending>)"),
        }
    }
}

impl<F: Copy> Original<F> {
    fn new() -> Self {
        const { assert!(std::mem::size_of::<F>() == std::mem::size_of::<usize>()) };
        Self {
            slot: Default::default(),
            _marker: PhantomData,
        }
    }
    pub fn get(&self) -> Option<F> {
        // SAFETY: `F` is pointer sized and the slot holds the entry point of code with F's signature
        self.slot
            .get()
            .map(|address| unsafe { std::mem::transmute_copy::<usize, F>(address) })
    }
    pub fn address(&self) -> Option<usize> {
        self.slot.get().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Jump,
    Call,
    ImportTable,
    VtableSlot,
}

/// An installed hook. Kept by the engine for the lifetime of the process.
pub struct HookRecord {
    pub name: String,
    pub kind: HookKind,
    /// Patched code address, or the patched pointer slot.
    pub target: usize,
    pub replacement: usize,
    pub original: usize,
    detour: Option<Box<dyn InlineDetour>>,
}

impl std::fmt::Debug for HookRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRecord")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("target", &format_args!("{:#x}", self.target))
            .field("replacement", &format_args!("{:#x}", self.replacement))
            .field("original", &format_args!("{:#x}", self.original))
            .field("inline", &self.detour.is_some())
            .finish()
    }
}

pub struct HookEngine {
    writer: Arc<dyn CodeWriter>,
    records: Vec<HookRecord>,
}

impl HookEngine {
    pub fn new(writer: Arc<dyn CodeWriter>) -> Self {
        Self {
            writer,
            records: vec![],
        }
    }

    /// Engine writing to the memory of the current process.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn native() -> Self {
        Self::new(Arc::new(native::NativeWriter))
    }

    pub fn begin<'a>(&self) -> Transaction<'a> {
        Transaction {
            requests: vec![],
            poisoned: None,
        }
    }

    pub fn records(&self) -> &[HookRecord] {
        &self.records
    }

    pub fn writer(&self) -> &Arc<dyn CodeWriter> {
        &self.writer
    }
}

enum Site<'a> {
    Inline { target: usize, call: bool },
    Import { image: MemoryRegion<'a>, module: String, import: ImportName },
    Vtable { table: usize, index: usize },
}

struct Request<'a> {
    name: String,
    site: Site<'a>,
    replacement: usize,
    slot: Arc<OnceLock<usize>>,
}

enum Action {
    Detour(Box<dyn InlineDetour>),
    Pointer { original: usize },
}

struct Prepared {
    name: String,
    kind: HookKind,
    target: usize,
    replacement: usize,
    slot: Arc<OnceLock<usize>>,
    action: Action,
}

impl Request<'_> {
    unsafe fn prepare(self, writer: &dyn CodeWriter) -> Result<Prepared, HookError> {
        let (kind, target, action) = match self.site {
            Site::Inline { target, call } => {
                let detour = writer.prepare_detour(target, self.replacement)?;
                let kind = if call { HookKind::Call } else { HookKind::Jump };
                (kind, target, Action::Detour(detour))
            }
            Site::Import {
                image,
                module,
                import,
            } => {
                let rva = imports::find_import_slot(image.data(), &module, &import)?.ok_or_else(
                    || HookError::ImportNotFound {
                        module: module.clone(),
                        import: import.to_string(),
                    },
                )?;
                let slot = image.base() + rva as usize;
                let original = read_pointer(writer, slot)?;
                (HookKind::ImportTable, slot, Action::Pointer { original })
            }
            Site::Vtable { table, index } => {
                let slot = table + index * std::mem::size_of::<usize>();
                let original = read_pointer(writer, slot)?;
                (HookKind::VtableSlot, slot, Action::Pointer { original })
            }
        };
        Ok(Prepared {
            name: self.name,
            kind,
            target,
            replacement: self.replacement,
            slot: self.slot,
            action,
        })
    }
}

unsafe fn read_pointer(writer: &dyn CodeWriter, address: usize) -> Result<usize, HookError> {
    let bytes = writer.read(address, std::mem::size_of::<usize>())?;
    let bytes = bytes
        .try_into()
        .map_err(|_| HookError::Memory { address })?;
    Ok(usize::from_ne_bytes(bytes))
}

impl Prepared {
    unsafe fn apply(&mut self, writer: &dyn CodeWriter) -> Result<(), HookError> {
        match &mut self.action {
            Action::Detour(detour) => detour.enable(),
            Action::Pointer { .. } => writer.write(self.target, &self.replacement.to_ne_bytes()),
        }
    }
    unsafe fn revert(&mut self, writer: &dyn CodeWriter) -> Result<(), HookError> {
        match &mut self.action {
            Action::Detour(detour) => detour.disable(),
            Action::Pointer { original } => writer.write(self.target, &original.to_ne_bytes()),
        }
    }
    fn original(&self) -> usize {
        match &self.action {
            Action::Detour(detour) => detour.trampoline(),
            Action::Pointer { original } => *original,
        }
    }
    fn into_record(self) -> HookRecord {
        let original = self.original();
        HookRecord {
            name: self.name,
            kind: self.kind,
            target: self.target,
            replacement: self.replacement,
            original,
            detour: match self.action {
                Action::Detour(detour) => Some(detour),
                Action::Pointer { .. } => None,
            },
        }
    }
}

/// A batch of hook requests. Nothing is written before [`Transaction::commit`].
pub struct Transaction<'a> {
    requests: Vec<Request<'a>>,
    poisoned: Option<HookError>,
}

impl<'a> Transaction<'a> {
    fn push<F: Copy>(&mut self, name: String, site: Option<Site<'a>>, replacement: usize) -> Original<F> {
        let original = Original::new();
        match site {
            Some(site) => self.requests.push(Request {
                name,
                site,
                replacement,
                slot: original.slot.clone(),
            }),
            None => {
                tracing::error!("hook target {name} is unresolved");
                self.poisoned
                    .get_or_insert(HookError::UnresolvedTarget { name });
            }
        }
        original
    }

    /// Redirect the code at `target` to `replacement`.
    pub fn jump<F: Copy>(&mut self, target: impl HookTarget, replacement: F) -> Original<F> {
        let site = target.resolve().map(|target| Site::Inline { target, call: false });
        self.push(target.describe(), site, fn_address(replacement))
    }

    /// Redirect the code at `target` to the code at `replacement`, e.g. an assembled stub.
    /// The original is returned as a plain address.
    pub fn jump_address(&mut self, target: impl HookTarget, replacement: usize) -> Original<usize> {
        let site = target.resolve().map(|target| Site::Inline { target, call: false });
        self.push(target.describe(), site, replacement)
    }

    /// Like [`Transaction::jump`], but the patch calls `replacement` instead of jumping to it.
    pub fn call<F: Copy>(&mut self, target: impl HookTarget, replacement: F) -> Original<F> {
        let site = target.resolve().map(|target| Site::Inline { target, call: true });
        self.push(target.describe(), site, fn_address(replacement))
    }

    /// Point the import address table entry of `module!import` in `image` at `replacement`.
    pub fn import<F: Copy>(
        &mut self,
        image: MemoryRegion<'a>,
        module: &str,
        import: impl Into<ImportName>,
        replacement: F,
    ) -> Original<F> {
        let import = import.into();
        let name = format!("{module}!{import}");
        let site = Site::Import {
            image,
            module: module.to_string(),
            import,
        };
        self.push(name, Some(site), fn_address(replacement))
    }

    /// Overwrite entry `index` of the function table at `table`.
    pub fn vtable<F: Copy>(&mut self, table: impl HookTarget, index: usize, replacement: F) -> Original<F> {
        let name = format!("{}[{index}]", table.describe());
        let site = table.resolve().map(|table| Site::Vtable { table, index });
        self.push(name, site, fn_address(replacement))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Discard every request. Nothing has been written.
    pub fn abort(self) {
        tracing::debug!("aborted transaction with {} requests", self.requests.len());
    }

    /// Apply every request or none. Returns the number of installed hooks.
    ///
    /// # Safety
    /// Every target must be valid for the kind of patch requested and no other thread
    /// may run the patched code while it is written.
    pub unsafe fn commit(self, engine: &mut HookEngine) -> Result<usize, HookError> {
        if let Some(err) = self.poisoned {
            return Err(err);
        }
        let writer = engine.writer.clone();
        let writer = &*writer;

        let mut prepared = Vec::with_capacity(self.requests.len());
        for request in self.requests {
            prepared.push(request.prepare(writer)?);
        }

        for i in 0..prepared.len() {
            if let Err(err) = prepared[i].apply(writer) {
                tracing::error!("failed to install {}: {err}", prepared[i].name);
                for applied in prepared[..i].iter_mut().rev() {
                    if let Err(revert) = applied.revert(writer) {
                        tracing::error!("failed to revert {}: {revert}", applied.name);
                    }
                }
                return Err(err);
            }
        }

        let count = prepared.len();
        let first = engine.records.len();
        for hook in prepared {
            let _ = hook.slot.set(hook.original());
            tracing::debug!(
                "installed {:?} hook {} at {:#x}",
                hook.kind,
                hook.name,
                hook.target
            );
            engine.records.push(hook.into_record());
        }

        // turn the `jmp rel32` of call style hooks into `call rel32`
        for record in &engine.records[first..] {
            if record.kind != HookKind::Call {
                continue;
            }
            match writer.read(record.target, 1).as_deref() {
                Ok([0xE9]) => {
                    if let Err(err) = writer.write(record.target, &[0xE8]) {
                        tracing::error!("call fixup of {} failed: {err}", record.name);
                    }
                }
                _ => tracing::warn!(
                    "call fixup of {} skipped: patch does not start with a near jump",
                    record.name
                ),
            }
        }

        tracing::info!("committed {count} hooks");
        Ok(count)
    }
}
