//! Process and Thread Creation
//!
//! # Process Creation
//! - `create_idle_process`: one per processor, never queued
//! - `create_kernel_process`: kernel entry point on the kernel root
//! - `create_elf_process`: a user image with its own address space
//!
//! # Thread Creation
//! - `create_child_thread`: an extra user thread in a running process
//!
//! # User Image Layout
//!
//! ```text
//! 0x7F_F000_0000  environment block (one page, GS base)
//! 0x7F_E000_0000  shared data window (read-only, every process)
//! 0x7F_C000_0000  dynamic linker
//! 0x70_00A0_0000  signal trampoline
//! 0x70_0000_0000  user stack (4 MiB, top pages committed)
//! ```
//!
//! A failed creation tears the half-built process down through the
//! normal termination path and frees it before returning the error; it
//! is never visible in the process table.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use x86_64::VirtAddr;

use super::peb::EnvironmentBlock;
use super::process::ProcessParams;
use super::{Process, ProcessManager, PsError};
use crate::config::{
    ENVIRONMENT_BLOCK_BASE, EXECUTABLE_BASE, INTERPRETER_BASE, INTERPRETER_PATH, KERNEL_CS,
    KERNEL_SS, KERNEL_THREAD_PRIORITY, LOG_DEVICE_PATH, NULL_DEVICE_PATH, PAGE_SIZE,
    ROOT_DIRECTORY, SHARED_DATA_BASE, SIGNAL_TRAMPOLINE_BASE, USER_CS, USER_RFLAGS, USER_SS,
    USER_STACK_BASE, USER_STACK_EAGER_PAGES, USER_STACK_SIZE, USER_THREAD_PRIORITY,
};
use crate::ke::bugcheck::{codes, ke_bug_check_ex};
use crate::ke::thread::RegisterContext;
use crate::ke::{Thread, ThreadState};
use crate::ldr::stack::{AT_ENTRY, AT_PHDR, AT_PHENT, AT_PHNUM, AT_SYSINFO_EHDR};
use crate::ldr::{bind_plt, AuxEntry, DynamicInfo, ElfImage, ImageKind, InitialStack, LoadError};
use crate::mm::{AddressSpace, MappedRegion, MmError, RegionFlags};
use crate::ob::handle::{STDERR_HANDLE, STDIN_HANDLE, STDOUT_HANDLE};
use crate::ob::namespace::{read_all, resolve_directory};
use crate::ob::{HandleEntry, ObError};

impl ProcessManager {
    // ========================================================================
    // Idle and kernel processes
    // ========================================================================

    /// Build an idle process. Its thread has a zero time slice, so the
    /// scheduler only runs it when nothing else can run.
    pub fn create_idle_process(&self, entry: VirtAddr) -> Result<Arc<Process>, PsError> {
        let process = Process::new(ProcessParams {
            pid: self.pids.allocate(),
            name: "idle",
            working_dir: ROOT_DIRECTORY,
            working_dir_node: None,
            address_space: None,
            is_idle: true,
            creation_time: self.platform.uptime_us(),
        });

        let thread = process.main_thread();
        thread.set_time_slice(0);
        thread.set_priority(0);
        thread.kernel_lock().acquire();
        set_kernel_entry(&thread, entry);

        self.table.register(process.clone());
        log::debug!("[PS] [{}] idle process created", process.pid());
        Ok(process)
    }

    /// Build and start a process running `entry` in kernel mode
    pub fn create_kernel_process(
        &self,
        entry: VirtAddr,
        name: &str,
        parent: Option<&Arc<Process>>,
    ) -> Result<Arc<Process>, PsError> {
        let working_dir = inherited_working_dir(parent);
        let node = resolve_directory(self.namespace.as_ref(), &working_dir).ok();

        let process = Process::new(ProcessParams {
            pid: self.pids.allocate(),
            name,
            working_dir: &working_dir,
            working_dir_node: node,
            address_space: None,
            is_idle: false,
            creation_time: self.platform.uptime_us(),
        });

        let thread = process.main_thread();
        thread.set_priority(KERNEL_THREAD_PRIORITY);
        // Kernel threads never leave kernel mode.
        thread.kernel_lock().acquire();
        set_kernel_entry(&thread, entry);

        self.adopt(&process, parent);
        log::debug!("[PS] [{}] kernel process '{}' created", process.pid(), name);
        Ok(process)
    }

    // ========================================================================
    // ELF processes
    // ========================================================================

    /// Build and start a process from the ELF image in `bytes`
    pub fn create_elf_process(
        &self,
        bytes: &[u8],
        argv: &[&str],
        envp: &[&str],
        exec_path: Option<&str>,
        parent: Option<&Arc<Process>>,
    ) -> Result<Arc<Process>, PsError> {
        let image = ElfImage::parse(bytes)?;
        let space = AddressSpace::new(self.paging.clone())?;

        let name = argv.first().copied().or(exec_path).unwrap_or("process");
        let working_dir = inherited_working_dir(parent);
        let node = resolve_directory(self.namespace.as_ref(), &working_dir).ok();

        let process = Process::new(ProcessParams {
            pid: self.pids.allocate(),
            name,
            working_dir: &working_dir,
            working_dir_node: node,
            address_space: Some(space),
            is_idle: false,
            creation_time: self.platform.uptime_us(),
        });
        if let Some(parent) = parent {
            process.set_credentials(parent.credentials());
        }

        let thread = process.main_thread();
        let loaded = process
            .address_space()
            .ok_or(PsError::Mm(MmError::NotMapped))
            .and_then(|space| self.load_user_image(&process, &thread, &space, &image, argv, envp, exec_path));
        if let Err(error) = loaded {
            log::error!("[PS] [{}] failed to load '{}': {}", process.pid(), name, error);
            self.abandon(&process);
            return Err(error);
        }

        if let Err(error) = self.open_standard_handles(&process) {
            self.abandon(&process);
            return Err(error.into());
        }
        self.adopt(&process, parent);
        log::debug!(
            "[PS] [{}] '{}' created, entry {:#x}",
            process.pid(),
            name,
            thread.context().registers.rip
        );
        Ok(process)
    }

    /// Add a user thread to `process` starting at `entry` with `stack`
    pub fn create_child_thread(
        &self,
        process: &Arc<Process>,
        entry: VirtAddr,
        stack: VirtAddr,
    ) -> Result<Arc<Thread>, PsError> {
        let thread = process.add_thread()?;
        thread.set_priority(USER_THREAD_PRIORITY);
        {
            let mut context = thread.context();
            context.registers = RegisterContext {
                rip: entry.as_u64(),
                rsp: stack.as_u64(),
                cs: USER_CS,
                ss: USER_SS,
                rflags: USER_RFLAGS,
                ..RegisterContext::default()
            };
            context.gs_base = process.environment_block().map_or(0, VirtAddr::as_u64);
        }

        if thread.state() != ThreadState::Dying {
            self.scheduler.insert_new_thread(thread.clone());
        }
        log::debug!("[PS] [{}] thread {} created", process.pid(), thread.tid().0);
        Ok(thread)
    }

    // ========================================================================
    // Shared pieces
    // ========================================================================

    /// Link to the parent, register and queue a fully built process
    fn adopt(&self, process: &Arc<Process>, parent: Option<&Arc<Process>>) {
        if let Some(parent) = parent {
            parent.add_child(process.clone());
            process.set_parent(Some(parent));
        }
        self.table.register(process.clone());
        process.start(&self.scheduler);
    }

    /// Tear down a process that never became visible
    pub(super) fn abandon(&self, process: &Arc<Process>) {
        self.die(process);
        self.table.reap(process.pid());
    }

    /// Load `image` into `space` and point `thread` at it.
    ///
    /// Maps the stack, the shared windows and a fresh environment block,
    /// loads the dynamic linker if the image asks for one and builds the
    /// initial stack. Used by both creation and exec.
    pub(super) fn load_user_image(
        &self,
        process: &Arc<Process>,
        thread: &Arc<Thread>,
        space: &AddressSpace,
        image: &ElfImage,
        argv: &[&str],
        envp: &[&str],
        exec_path: Option<&str>,
    ) -> Result<(), PsError> {
        let stack = space.allocate_anonymous(
            USER_STACK_SIZE,
            VirtAddr::new(USER_STACK_BASE),
            false,
            RegionFlags::READ_WRITE,
        )?;
        let top = stack.end();
        for page in 1..=USER_STACK_EAGER_PAGES {
            space.hit(top - page * PAGE_SIZE)?;
        }

        let shared = self.map_shared_windows(process, space, None)?;
        let block = space.allocate_anonymous(
            PAGE_SIZE,
            VirtAddr::new(ENVIRONMENT_BLOCK_BASE),
            true,
            RegionFlags::READ_WRITE,
        )?;
        space.force_allocate(block.base())?;

        let base = match image.kind() {
            ImageKind::SharedObject => VirtAddr::new(EXECUTABLE_BASE),
            ImageKind::Executable => VirtAddr::zero(),
        };
        image.map_segments(space, base)?;
        process.set_executable_base(base);

        let entry = match image.interpreter() {
            Some(path) => self.load_interpreter(space, path, &shared)?,
            None => base + image.entry(),
        };

        process.set_environment_block(Some(block.base()));
        self.write_environment_block(process, space, &shared, block.base())?;

        let initial = InitialStack {
            argv,
            envp,
            exec_path,
            auxv: vec![
                AuxEntry::new(AT_PHDR, base.as_u64() + image.phdr()),
                AuxEntry::new(AT_PHENT, image.phent() as u64),
                AuxEntry::new(AT_PHNUM, image.phnum() as u64),
                AuxEntry::new(AT_ENTRY, base.as_u64() + image.entry()),
                AuxEntry::new(AT_SYSINFO_EHDR, self.linker_vectors(&shared).as_u64()),
            ],
        };
        let rsp = initial.write(space, top)?;
        if !rsp.is_aligned(16u64) {
            ke_bug_check_ex(
                codes::USER_STACK_MISALIGNED,
                process.pid().as_u32() as u64,
                rsp.as_u64(),
                top.as_u64(),
                0,
            );
        }

        thread.set_priority(USER_THREAD_PRIORITY);
        thread.refill_time_slice();
        let mut context = thread.context();
        context.registers = RegisterContext {
            rip: entry.as_u64(),
            rsp: rsp.as_u64(),
            rbp: rsp.as_u64(),
            cs: USER_CS,
            ss: USER_SS,
            rflags: USER_RFLAGS,
            ..RegisterContext::default()
        };
        context.fx_state.reset();
        context.fs_base = 0;
        context.gs_base = block.base().as_u64();
        context.user_stack_base = stack.base();
        context.user_stack_limit = top;
        Ok(())
    }

    /// Map the shared-data window and the signal trampoline.
    ///
    /// `existing` names a shared-data region already present (fork); only
    /// a missing one is mapped again.
    pub(super) fn map_shared_windows(
        &self,
        process: &Process,
        space: &AddressSpace,
        existing: Option<VirtAddr>,
    ) -> Result<MappedRegion, PsError> {
        let shared = match existing.and_then(|base| space.region_at(base)) {
            Some(region) if region.object().is_shared_data() => region,
            _ => {
                let object = self.shared_data.object(&self.paging)?;
                space.map_object(
                    object,
                    VirtAddr::new(SHARED_DATA_BASE),
                    true,
                    RegionFlags::READ_EXECUTE,
                )?
            }
        };
        process.set_shared_data_base(Some(shared.base()));

        let trampoline_base = VirtAddr::new(SIGNAL_TRAMPOLINE_BASE);
        if space.region_at(trampoline_base).is_none() {
            let trampoline =
                space.allocate_anonymous(PAGE_SIZE, trampoline_base, true, RegionFlags::READ_EXECUTE)?;
            space.force_allocate(trampoline.base())?;
            let code = &self.shared_data.image().signal_trampoline;
            if !code.is_empty() {
                space.write(trampoline.base(), code)?;
            }
        }
        process.set_signal_trampoline(Some(trampoline_base));
        Ok(shared)
    }

    /// Base of the linker call vector table inside the mapped window
    fn linker_vectors(&self, shared: &MappedRegion) -> VirtAddr {
        shared.base() + self.shared_data.image().linker_vector_offset
    }

    /// Fill the environment block at `base` for `process`
    pub(super) fn write_environment_block(
        &self,
        process: &Process,
        space: &AddressSpace,
        shared: &MappedRegion,
        base: VirtAddr,
    ) -> Result<(), PsError> {
        let image = self.shared_data.image();
        let block = EnvironmentBlock {
            self_address: base.as_u64(),
            pid: process.pid().as_u32() as u64,
            executable_base: process.executable_base().as_u64(),
            shared_data_base: shared.base().as_u64(),
            shared_data_size: shared.size(),
            linker_vector_base: self.linker_vectors(shared).as_u64(),
            linker_vector_size: image.linker_vector_size,
        };
        block.write_to(space, base)?;
        Ok(())
    }

    /// Load the dynamic linker and bind its PLT, returning its entry
    fn load_interpreter(
        &self,
        space: &AddressSpace,
        path: &str,
        shared: &MappedRegion,
    ) -> Result<VirtAddr, PsError> {
        let path = if path.is_empty() { INTERPRETER_PATH } else { path };
        let node = self
            .namespace
            .resolve(path)
            .ok_or(LoadError::InterpreterNotFound)?;
        let bytes = read_all(node.as_ref())?;
        let interpreter = ElfImage::parse(&bytes)?;

        let base = VirtAddr::new(INTERPRETER_BASE);
        interpreter.map_segments(space, base)?;

        if let Some((dynamic, size)) = interpreter.dynamic() {
            let info = DynamicInfo::read(space, base, dynamic, size)?;
            let vectors = self.linker_vectors(shared);
            bind_plt(space, base, &info, self.shared_data.image(), vectors)?;
        }

        log::trace!("[LDR] interpreter '{}' at {:#x}", path, base.as_u64());
        Ok(base + interpreter.entry())
    }

    /// Point handles 0-2 at the null and log devices
    fn open_standard_handles(&self, process: &Process) -> Result<(), ObError> {
        let open = |path: &str| match self.namespace.resolve(path).map(|node| node.open()) {
            Some(Ok(object)) => Some(object),
            Some(Err(error)) => {
                log::warn!("[PS] [{}] could not open {}: {}", process.pid(), path, error);
                None
            }
            None => {
                log::warn!("[PS] [{}] {} not present", process.pid(), path);
                None
            }
        };

        if let Some(null) = open(NULL_DEVICE_PATH) {
            process.handles().replace(STDIN_HANDLE, Some(HandleEntry::new(null)))?;
        }
        if let Some(console) = open(LOG_DEVICE_PATH) {
            process
                .handles()
                .replace(STDOUT_HANDLE, Some(HandleEntry::new(console.clone())))?;
            process.handles().replace(STDERR_HANDLE, Some(HandleEntry::new(console)))?;
        }
        Ok(())
    }
}

fn inherited_working_dir(parent: Option<&Arc<Process>>) -> String {
    parent.map_or_else(|| String::from(ROOT_DIRECTORY), |p| p.working_dir())
}

fn set_kernel_entry(thread: &Thread, entry: VirtAddr) {
    let rsp = thread.kernel_stack().top().as_u64();
    let mut context = thread.context();
    context.registers = RegisterContext {
        rip: entry.as_u64(),
        rsp,
        rbp: rsp,
        cs: KERNEL_CS,
        ss: KERNEL_SS,
        rflags: USER_RFLAGS,
        ..RegisterContext::default()
    };
}
