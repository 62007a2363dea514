//! Hosted stand-ins for the collaborators, used by unit tests.
//!
//! Host threads play the part of processors: each one binds itself to a
//! CPU number, and dispatching away from a retired thread unwinds the
//! host thread with a [`ThreadExit`] payload.

use std::any::Any;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::arch::interrupts;
use crate::config::PAGE_SIZE;
use crate::hal::Platform;
use crate::ke::{CpuId, Thread};
use crate::ldr::dynamic::{DT_JMPREL, DT_NULL, DT_PLTRELSZ, DT_STRTAB, DT_SYMTAB, R_X86_64_JUMP_SLOT};
use crate::mm::{MmError, Paging, RegionFlags, SharedDataImage};
use crate::ob::{FsNode, KernelObject, Namespace, ObError};
use crate::ps::ProcessManager;

pub use crate::ldr::dynamic::STB_WEAK;

/// Strong symbol binding
pub const STB_GLOBAL: u8 = 1;

// ============================================================================
// Platform
// ============================================================================

std::thread_local! {
    static CPU: Cell<CpuId> = const { Cell::new(0) };
}

/// Make the calling host thread act as processor `cpu`
pub fn bind_cpu(cpu: CpuId) {
    CPU.with(|c| c.set(cpu));
}

/// Unwind payload of a host thread whose kernel thread was retired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadExit {
    pub cpu: CpuId,
}

pub struct SimPlatform {
    cpus: usize,
    ipis: Mutex<Vec<(CpuId, u8)>>,
    clock: AtomicU64,
}

impl SimPlatform {
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            ipis: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Every IPI requested so far, in order
    pub fn ipis(&self) -> Vec<(CpuId, u8)> {
        self.ipis.lock().unwrap().clone()
    }
}

impl Platform for SimPlatform {
    fn processor_count(&self) -> usize {
        self.cpus
    }

    fn current_processor(&self) -> CpuId {
        CPU.with(|c| c.get())
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn request_ipi(&self, target: CpuId, vector: u8) {
        self.ipis.lock().unwrap().push((target, vector));
    }

    fn dispatch(&self, cpu: CpuId) {
        panic::resume_unwind(Box::new(ThreadExit { cpu }));
    }

    fn uptime_us(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

// ============================================================================
// Paging
// ============================================================================

const KERNEL_ROOT: u64 = 0x1000;
const FIRST_ROOT: u64 = 0x10_0000;
const FIRST_FRAME: u64 = 0x1_0000_0000;

#[derive(Default)]
struct PagingState {
    next_root: u64,
    next_frame: u64,
    live_frames: BTreeSet<u64>,
    tables: BTreeMap<u64, BTreeMap<u64, (PhysAddr, PageTableFlags)>>,
    destroyed: BTreeSet<u64>,
    activations: Vec<(PhysAddr, bool)>,
}

/// Page tables kept as maps, with frame accounting
pub struct SimPaging {
    state: Mutex<PagingState>,
    frame_limit: Option<usize>,
}

impl SimPaging {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PagingState {
                next_root: FIRST_ROOT,
                next_frame: FIRST_FRAME,
                ..PagingState::default()
            }),
            frame_limit: None,
        }
    }

    /// Fail frame allocation once `limit` frames are live
    pub fn with_frame_limit(limit: usize) -> Self {
        Self {
            frame_limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn live_frames(&self) -> usize {
        self.state.lock().unwrap().live_frames.len()
    }

    pub fn is_mapped(&self, root: PhysAddr, page: VirtAddr) -> bool {
        self.mapping(root, page).is_some()
    }

    pub fn mapping(&self, root: PhysAddr, page: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
        let state = self.state.lock().unwrap();
        let page = page.align_down(PAGE_SIZE).as_u64();
        state.tables.get(&root.as_u64())?.get(&page).copied()
    }

    pub fn is_destroyed(&self, root: PhysAddr) -> bool {
        self.state.lock().unwrap().destroyed.contains(&root.as_u64())
    }

    /// Every root activated so far, with the interrupt flag at the time
    pub fn activations(&self) -> Vec<(PhysAddr, bool)> {
        self.state.lock().unwrap().activations.clone()
    }
}

impl Paging for SimPaging {
    fn create_root(&self) -> Result<PhysAddr, MmError> {
        let mut state = self.state.lock().unwrap();
        let root = state.next_root;
        state.next_root += PAGE_SIZE;
        state.tables.insert(root, BTreeMap::new());
        Ok(PhysAddr::new(root))
    }

    fn destroy_root(&self, root: PhysAddr) {
        let mut state = self.state.lock().unwrap();
        state.tables.remove(&root.as_u64());
        state.destroyed.insert(root.as_u64());
    }

    fn kernel_root(&self) -> PhysAddr {
        PhysAddr::new(KERNEL_ROOT)
    }

    fn activate(&self, root: PhysAddr) {
        let enabled = interrupts::are_enabled();
        self.state.lock().unwrap().activations.push((root, enabled));
    }

    fn allocate_frame(&self) -> Result<PhysAddr, MmError> {
        let mut state = self.state.lock().unwrap();
        if self.frame_limit.is_some_and(|limit| state.live_frames.len() >= limit) {
            return Err(MmError::OutOfMemory);
        }
        let frame = state.next_frame;
        state.next_frame += PAGE_SIZE;
        state.live_frames.insert(frame);
        Ok(PhysAddr::new(frame))
    }

    fn free_frame(&self, frame: PhysAddr) {
        self.state.lock().unwrap().live_frames.remove(&frame.as_u64());
    }

    fn map_page(&self, root: PhysAddr, page: VirtAddr, frame: PhysAddr, flags: PageTableFlags) {
        let mut state = self.state.lock().unwrap();
        state
            .tables
            .entry(root.as_u64())
            .or_default()
            .insert(page.align_down(PAGE_SIZE).as_u64(), (frame, flags));
    }

    fn unmap_page(&self, root: PhysAddr, page: VirtAddr) {
        let mut state = self.state.lock().unwrap();
        if let Some(table) = state.tables.get_mut(&root.as_u64()) {
            table.remove(&page.align_down(PAGE_SIZE).as_u64());
        }
    }
}

// ============================================================================
// Objects and namespace
// ============================================================================

/// A named object with no behaviour
pub struct TestObject {
    name: String,
}

impl TestObject {
    pub fn new(name: &str) -> Arc<dyn KernelObject> {
        Arc::new(Self {
            name: String::from(name),
        })
    }
}

impl KernelObject for TestObject {
    fn type_name(&self) -> &'static str {
        "test"
    }
}

impl core::fmt::Debug for TestObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TestObject({})", self.name)
    }
}

struct SimNode {
    path: String,
    contents: Option<Vec<u8>>,
}

impl FsNode for SimNode {
    fn is_directory(&self) -> bool {
        self.contents.is_none()
    }

    fn size(&self) -> u64 {
        self.contents.as_ref().map_or(0, |c| c.len() as u64)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ObError> {
        let contents = self.contents.as_ref().ok_or(ObError::InvalidArgument)?;
        let start = (offset as usize).min(contents.len());
        let n = buf.len().min(contents.len() - start);
        buf[..n].copy_from_slice(&contents[start..start + n]);
        Ok(n)
    }

    fn open(&self) -> Result<Arc<dyn KernelObject>, ObError> {
        Ok(TestObject::new(&self.path))
    }
}

/// Flat path -> node map
pub struct SimNamespace {
    nodes: BTreeMap<String, Arc<SimNode>>,
}

impl SimNamespace {
    /// Root, /dev and the two standard devices
    pub fn new() -> Self {
        let mut ns = Self {
            nodes: BTreeMap::new(),
        };
        ns.add_directory("/");
        ns.add_directory("/dev");
        ns.add("/dev/null", Some(Vec::new()));
        ns.add("/dev/kernellog", Some(Vec::new()));
        ns
    }

    pub fn with_file(mut self, path: &str, contents: Vec<u8>) -> Self {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let mut parent = String::new();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            parent.push('/');
            parent.push_str(part);
            self.add_directory(&parent);
        }
        self.add(path, Some(contents));
        self
    }

    pub fn without_devices(mut self) -> Self {
        self.nodes.remove("/dev/null");
        self.nodes.remove("/dev/kernellog");
        self
    }

    fn add_directory(&mut self, path: &str) {
        if !self.nodes.contains_key(path) {
            self.add(path, None);
        }
    }

    fn add(&mut self, path: &str, contents: Option<Vec<u8>>) {
        let node = SimNode {
            path: String::from(path),
            contents,
        };
        self.nodes.insert(String::from(path), Arc::new(node));
    }
}

impl Namespace for SimNamespace {
    fn resolve(&self, path: &str) -> Option<Arc<dyn FsNode>> {
        self.nodes.get(path).map(|node| node.clone() as Arc<dyn FsNode>)
    }
}

// ============================================================================
// Images
// ============================================================================

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const ET_DYN: u16 = 3;

struct Segment {
    kind: u32,
    vaddr: u64,
    flags: u32,
    data: Vec<u8>,
    mem_size: u64,
}

/// Builds small ELF64 files for the loader tests
pub struct ElfBuilder {
    entry: u64,
    machine: u16,
    object_type: u16,
    interpreter: Option<String>,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn executable(entry: u64) -> Self {
        Self {
            entry,
            machine: 62,
            object_type: 2,
            interpreter: None,
            segments: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn object_type(mut self, object_type: u16) -> Self {
        self.object_type = object_type;
        self
    }

    pub fn interpreter(mut self, path: &str) -> Self {
        self.interpreter = Some(String::from(path));
        self
    }

    pub fn segment(mut self, vaddr: u64, flags: RegionFlags, data: &[u8], mem_size: u64) -> Self {
        let mut p_flags = 0;
        if flags.contains(RegionFlags::EXECUTE) {
            p_flags |= 1;
        }
        if flags.contains(RegionFlags::WRITE) {
            p_flags |= 2;
        }
        if flags.contains(RegionFlags::READ) {
            p_flags |= 4;
        }
        self.segments.push(Segment {
            kind: PT_LOAD,
            vaddr,
            flags: p_flags,
            data: data.to_vec(),
            mem_size,
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut segments = Vec::new();
        if let Some(path) = &self.interpreter {
            let mut data = path.as_bytes().to_vec();
            data.push(0);
            let size = data.len() as u64;
            segments.push(Segment {
                kind: PT_INTERP,
                vaddr: 0,
                flags: 4,
                data,
                mem_size: size,
            });
        }
        segments.extend(self.segments);

        let mut out = elf_header(self.object_type, self.machine, self.entry, segments.len() as u16);
        let mut offset = (EHDR_SIZE + PHDR_SIZE * segments.len()) as u64;
        for segment in &segments {
            let file_size = segment.data.len() as u64;
            push_phdr(&mut out, segment.kind, segment.flags, offset, segment.vaddr, file_size, segment.mem_size);
            offset += file_size;
        }
        for segment in &segments {
            out.extend_from_slice(&segment.data);
        }
        out
    }
}

fn elf_header(object_type: u16, machine: u16, entry: u64, phnum: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(0x1000);
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&object_type.to_le_bytes());
    out.extend_from_slice(&machine.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&phnum.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

fn push_phdr(out: &mut Vec<u8>, kind: u32, flags: u32, offset: u64, vaddr: u64, file_size: u64, mem_size: u64) {
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(&mem_size.to_le_bytes());
    out.extend_from_slice(&PAGE_SIZE.to_le_bytes());
}

const INTERP_SIZE: usize = 0x1000;
const INTERP_DYNAMIC: usize = 0x100;
const INTERP_SYMTAB: usize = 0x200;
const INTERP_STRTAB: usize = 0x400;
const INTERP_JMPREL: usize = 0x600;
const INTERP_SLOTS: usize = 0x800;
const INTERP_ENTRY: u64 = 0x900;

/// A position-independent dynamic linker whose PLT imports `imports`
/// (name, binding). Returns the file and each import's slot offset.
pub fn interpreter_image(imports: &[(&str, u8)]) -> (Vec<u8>, Vec<u64>) {
    let size = INTERP_SIZE as u64;
    let dynamic = INTERP_DYNAMIC as u64;
    let mut out = elf_header(ET_DYN, 62, INTERP_ENTRY, 2);
    push_phdr(&mut out, PT_LOAD, 7, 0, 0, size, size);
    push_phdr(&mut out, PT_DYNAMIC, 6, dynamic, dynamic, 5 * 16, 5 * 16);
    out.resize(INTERP_SIZE, 0);

    let put = |out: &mut Vec<u8>, at: usize, bytes: &[u8]| {
        out[at..at + bytes.len()].copy_from_slice(bytes);
    };

    let entries = [
        (DT_PLTRELSZ, (imports.len() * 24) as u64),
        (DT_STRTAB, INTERP_STRTAB as u64),
        (DT_SYMTAB, INTERP_SYMTAB as u64),
        (DT_JMPREL, INTERP_JMPREL as u64),
        (DT_NULL, 0),
    ];
    for (index, (tag, value)) in entries.iter().enumerate() {
        let at = INTERP_DYNAMIC + index * 16;
        put(&mut out, at, &tag.to_le_bytes());
        put(&mut out, at + 8, &value.to_le_bytes());
    }

    let mut name_offset = 1usize;
    let mut slots = Vec::new();
    for (index, (name, binding)) in imports.iter().enumerate() {
        let symbol = INTERP_SYMTAB + (index + 1) * 24;
        put(&mut out, symbol, &(name_offset as u32).to_le_bytes());
        put(&mut out, symbol + 4, &[(binding << 4) | 2]);
        put(&mut out, INTERP_STRTAB + name_offset, name.as_bytes());
        name_offset += name.len() + 1;

        let slot = (INTERP_SLOTS + index * 8) as u64;
        let rela = INTERP_JMPREL + index * 24;
        let info = ((index as u64 + 1) << 32) | R_X86_64_JUMP_SLOT as u64;
        put(&mut out, rela, &slot.to_le_bytes());
        put(&mut out, rela + 8, &info.to_le_bytes());
        slots.push(slot);
    }

    (out, slots)
}

/// Two-page shared-data window exporting `le_log` and `le_exit`
pub fn shared_data_image() -> SharedDataImage {
    let mut symbols = BTreeMap::new();
    symbols.insert(String::from("le_log"), 0x10);
    symbols.insert(String::from("le_exit"), 0x20);
    SharedDataImage {
        contents: vec![0xC3; 2 * PAGE_SIZE as usize],
        linker_vector_offset: 0x1000,
        linker_vector_size: 0x800,
        symbols,
        signal_trampoline: vec![0xCC; 32],
    }
}

/// A user program at 0x40_0000 asking for the standard dynamic linker
pub fn user_program() -> Vec<u8> {
    ElfBuilder::executable(0x40_1000)
        .interpreter(crate::config::INTERPRETER_PATH)
        .segment(0x40_0000, RegionFlags::READ_EXECUTE, &[0x90; 64], 0x2000)
        .segment(0x60_0000, RegionFlags::READ_WRITE, &[1, 2, 3, 4], 0x1000)
        .build()
}

// ============================================================================
// Whole machine
// ============================================================================

pub struct SimMachine {
    pub manager: Arc<ProcessManager>,
    pub platform: Arc<SimPlatform>,
    pub paging: Arc<SimPaging>,
}

/// A manager over `cpus` simulated processors with the dynamic linker
/// installed and every processor idle
pub fn machine(cpus: usize) -> SimMachine {
    machine_with(cpus, SimNamespace::new(), SimPaging::new())
}

pub fn machine_with(cpus: usize, namespace: SimNamespace, paging: SimPaging) -> SimMachine {
    let (linker, _) = interpreter_image(&[("le_log", STB_WEAK), ("le_exit", STB_WEAK)]);
    let namespace = namespace.with_file(crate::config::INTERPRETER_PATH, linker);

    let platform = Arc::new(SimPlatform::new(cpus));
    let paging = Arc::new(paging);
    let manager = ProcessManager::new(
        platform.clone(),
        paging.clone(),
        Arc::new(namespace),
        shared_data_image(),
    );
    manager
        .init(VirtAddr::new(0xFFFF_8000_0000_1000))
        .expect("idle processes");

    SimMachine {
        manager: Arc::new(manager),
        platform,
        paging,
    }
}

impl SimMachine {
    /// Run `f` on the calling host thread as `thread` executing on `cpu`.
    ///
    /// Returns `Err` when the kernel thread was retired and left the
    /// processor instead of returning.
    pub fn run_as<R>(
        &self,
        cpu: CpuId,
        thread: &Arc<Thread>,
        f: impl FnOnce(&ProcessManager) -> R,
    ) -> Result<R, ThreadExit> {
        bind_cpu(cpu);
        self.manager
            .scheduler()
            .processor(cpu)
            .run_queue()
            .set_current(Some(thread.clone()));

        let manager = self.manager.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| f(&manager))) {
            Ok(value) => Ok(value),
            Err(payload) => Err(thread_exit(payload)),
        }
    }

    /// [`SimMachine::run_as`] on a new host thread
    pub fn spawn_as<R: Send + 'static>(
        self: &Arc<Self>,
        cpu: CpuId,
        thread: &Arc<Thread>,
        f: impl FnOnce(&ProcessManager) -> R + Send + 'static,
    ) -> std::thread::JoinHandle<Result<R, ThreadExit>> {
        let machine = self.clone();
        let thread = thread.clone();
        std::thread::spawn(move || machine.run_as(cpu, &thread, f))
    }
}

fn thread_exit(payload: Box<dyn Any + Send>) -> ThreadExit {
    match payload.downcast::<ThreadExit>() {
        Ok(exit) => *exit,
        Err(other) => panic::resume_unwind(other),
    }
}
