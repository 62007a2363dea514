//! Fork
//!
//! The child gets a copy-on-write duplicate of the caller's address
//! space, the same handles (sharing the underlying objects), the same
//! credentials and signal dispositions, and a copy of the calling
//! thread's register state with RAX = 0.
//!
//! Two mappings are not inherited as plain copies:
//! - the shared-data window must sit at the same base in both; if the
//!   duplicate lacks it, it is mapped again rather than copied
//! - the environment block is dropped and rebuilt for the child
//!
//! The child's thread is queued only after its environment block is
//! valid.

use alloc::sync::Arc;

use x86_64::VirtAddr;

use super::process::ProcessParams;
use super::{Process, ProcessManager, PsError};
use crate::config::{ENVIRONMENT_BLOCK_BASE, PAGE_SIZE};
use crate::mm::{MmError, RegionFlags};

impl ProcessManager {
    /// Duplicate the current process, returning the child
    pub fn fork(&self) -> Result<Arc<Process>, PsError> {
        let (thread, parent) = self.current()?;
        if !parent.is_running() {
            return Err(PsError::ProcessNotRunning);
        }
        let parent_space = parent.address_space().ok_or(PsError::Mm(MmError::NotMapped))?;

        let space = parent_space.fork()?;
        let child = Process::new(ProcessParams {
            pid: self.pids.allocate(),
            name: &parent.name(),
            working_dir: &parent.working_dir(),
            working_dir_node: parent.working_dir_node(),
            address_space: Some(space),
            is_idle: false,
            creation_time: self.platform.uptime_us(),
        });

        child.set_credentials(parent.credentials());
        child.handles().copy_from(parent.handles());
        let handlers = *parent.signal_handlers();
        *child.signal_handlers() = handlers;
        child.set_executable_base(parent.executable_base());

        if let Err(error) = self.prepare_fork_child(&parent, &child) {
            log::error!("[PS] [{}] fork failed: {}", parent.pid(), error);
            self.abandon(&child);
            return Err(error);
        }

        let (registers, fx_state, fs_base, stack_base, stack_limit) = {
            let context = thread.context();
            (
                context.registers,
                context.fx_state.clone(),
                context.fs_base,
                context.user_stack_base,
                context.user_stack_limit,
            )
        };
        let child_thread = child.main_thread();
        child_thread.set_priority(thread.priority());
        child_thread.set_blocked_signals(thread.blocked_signals());
        {
            let mut context = child_thread.context();
            context.registers = registers;
            context.registers.rax = 0;
            context.fx_state = fx_state;
            context.fs_base = fs_base;
            context.gs_base = child.environment_block().map_or(0, VirtAddr::as_u64);
            context.user_stack_base = stack_base;
            context.user_stack_limit = stack_limit;
        }

        parent.add_child(child.clone());
        child.set_parent(Some(&parent));
        self.table.register(child.clone());
        child.start(&self.scheduler);

        log::debug!("[PS] [{}] forked child {}", parent.pid(), child.pid());
        Ok(child)
    }

    /// Fix up the duplicated address space for the child
    fn prepare_fork_child(&self, parent: &Process, child: &Process) -> Result<(), PsError> {
        let space = child.address_space().ok_or(PsError::Mm(MmError::NotMapped))?;

        if let Some(block) = parent.environment_block() {
            match space.unmap(block, PAGE_SIZE) {
                Ok(()) | Err(MmError::NotMapped) => {}
                Err(error) => return Err(error.into()),
            }
        }

        let shared = self.map_shared_windows(child, &space, parent.shared_data_base())?;

        let block = space.allocate_anonymous(
            PAGE_SIZE,
            VirtAddr::new(ENVIRONMENT_BLOCK_BASE),
            true,
            RegionFlags::READ_WRITE,
        )?;
        space.force_allocate(block.base())?;
        child.set_environment_block(Some(block.base()));
        self.write_environment_block(child, &space, &shared, block.base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SHARED_DATA_BASE;
    use crate::ob::handle::STDOUT_HANDLE;
    use crate::ps::peb::EnvironmentBlock;
    use crate::ps::Credentials;
    use crate::testing::{machine, user_program};

    const DATA: u64 = 0x60_0000;

    #[test]
    fn test_fork_duplicates_caller() {
        let m = machine(1);
        let parent = m
            .manager
            .create_elf_process(&user_program(), &["prog"], &[], None, None)
            .unwrap();
        let creds = Credentials {
            uid: 1000,
            gid: 100,
            euid: 0,
            egid: 100,
        };
        parent.set_credentials(creds);
        let main = parent.main_thread();
        {
            let mut context = main.context();
            context.registers.rax = 57;
            context.registers.rip = 0x40_1234;
        }
        let parent_space = parent.address_space().unwrap();
        parent_space.write_u64(VirtAddr::new(DATA), 0x1111).unwrap();

        let child = m.run_as(0, &main, |pm| pm.fork()).unwrap().unwrap();
        let child_space = child.address_space().unwrap();

        child_space.write_u64(VirtAddr::new(DATA), 0x2222).unwrap();
        assert_eq!(parent_space.read_u64(VirtAddr::new(DATA)).unwrap(), 0x1111);
        assert_eq!(child_space.read_u64(VirtAddr::new(DATA)).unwrap(), 0x2222);

        assert_eq!(child.credentials(), creds);
        assert_eq!(child.shared_data_base(), Some(VirtAddr::new(SHARED_DATA_BASE)));
        let shared = VirtAddr::new(SHARED_DATA_BASE);
        assert!(Arc::ptr_eq(
            parent_space.region_at(shared).unwrap().object(),
            child_space.region_at(shared).unwrap().object()
        ));
        assert!(Arc::ptr_eq(
            &parent.handles().object(STDOUT_HANDLE).unwrap(),
            &child.handles().object(STDOUT_HANDLE).unwrap()
        ));

        let block_base = child.environment_block().unwrap();
        let block = EnvironmentBlock::read_from(&child_space, block_base).unwrap();
        assert_eq!(block.pid, child.pid().as_u32() as u64);
        assert_eq!(block.self_address, block_base.as_u64());
        let parent_block =
            EnvironmentBlock::read_from(&parent_space, parent.environment_block().unwrap()).unwrap();
        assert_eq!(parent_block.pid, parent.pid().as_u32() as u64);

        let child_main = child.main_thread();
        let context = child_main.context();
        assert_eq!(context.registers.rax, 0);
        assert_eq!(context.registers.rip, 0x40_1234);
        assert_eq!(context.gs_base, block_base.as_u64());
    }

    #[test]
    fn test_fork_links_and_starts_child() {
        let m = machine(2);
        let parent = m
            .manager
            .create_elf_process(&user_program(), &["prog"], &[], None, None)
            .unwrap();
        let main = parent.main_thread();

        let child = m.run_as(0, &main, |pm| pm.fork()).unwrap().unwrap();

        assert_ne!(child.pid(), parent.pid());
        assert_eq!(child.name(), "prog");
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &parent));
        assert!(parent.child(child.pid()).is_some());
        assert!(child.is_started());
        assert!(m.manager.lookup(child.pid()).is_some());
    }

    #[test]
    fn test_fork_of_dying_process_fails() {
        let m = machine(1);
        let parent = m
            .manager
            .create_elf_process(&user_program(), &["prog"], &[], None, None)
            .unwrap();
        let main = parent.main_thread();
        assert!(parent.begin_dying());

        let result = m.run_as(0, &main, |pm| pm.fork().map(|c| c.pid()));
        assert_eq!(result, Ok(Err(PsError::ProcessNotRunning)));
    }
}
