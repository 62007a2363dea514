//! Exec
//!
//! Replaces the calling process's image. The new image is parsed and a
//! fresh address space created before anything is torn down; after that
//! point the old image is gone and a failure is fatal to the process.
//!
//! Order:
//! 1. Parse the image, create the new root
//! 2. Kill every other thread
//! 3. Switch to the new root with interrupts off, then drop the old space
//! 4. Close close-on-exec handles, reset caught signals
//! 5. Load the image into the new space

use alloc::sync::Arc;

use super::{ProcessManager, PsError};
use crate::arch::interrupts;
use crate::ldr::ElfImage;
use crate::mm::AddressSpace;

impl ProcessManager {
    /// Replace the current process's image with the ELF image in `bytes`
    pub fn execve(
        &self,
        bytes: &[u8],
        argv: &[&str],
        envp: &[&str],
        exec_path: Option<&str>,
    ) -> Result<(), PsError> {
        let (thread, process) = self.current()?;
        if !process.is_running() {
            return Err(PsError::ProcessNotRunning);
        }

        let image = ElfImage::parse(bytes)?;
        let space = Arc::new(AddressSpace::new(self.paging.clone())?);

        self.kill_all_other_threads(&process, &thread)?;

        let old = interrupts::without_interrupts(|| {
            let old = process.replace_address_space(Some(space.clone()));
            self.paging.activate(space.root());
            old
        });
        drop(old);

        let closed = process.handles().close_on_exec();
        let reset = process.reset_signal_handlers();
        process.set_environment_block(None);
        process.set_shared_data_base(None);
        process.set_signal_trampoline(None);
        if let Some(name) = argv.first().copied().or(exec_path) {
            process.set_name(name);
        }

        log::debug!(
            "[PS] [{}] exec '{}' ({} handles closed, {} handlers reset)",
            process.pid(),
            process.name(),
            closed,
            reset
        );

        self.load_user_image(&process, &thread, &space, &image, argv, envp, exec_path)
            .map_err(|error| {
                log::error!("[PS] [{}] exec failed after teardown: {}", process.pid(), error);
                error
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::ThreadState;
    use crate::ldr::LoadError;
    use crate::ob::handle::{STDERR_HANDLE, STDOUT_HANDLE};
    use crate::ps::signal::{SignalAction, SIGINT, SIGUSR1};
    use crate::testing::{machine, user_program};
    use x86_64::VirtAddr;

    #[test]
    fn test_exec_replaces_image() {
        let m = machine(2);
        let p = m
            .manager
            .create_elf_process(&user_program(), &["old"], &[], None, None)
            .unwrap();
        let main = p.main_thread();
        let extra = m
            .manager
            .create_child_thread(&p, VirtAddr::new(0x40_1000), VirtAddr::new(0x70_0020_0000))
            .unwrap();
        p.handles().set_close_on_exec(STDOUT_HANDLE, true).unwrap();
        {
            let mut handlers = p.signal_handlers();
            handlers[SIGUSR1 as usize].action = SignalAction::Handler(VirtAddr::new(0x40_2000));
            handlers[SIGINT as usize].action = SignalAction::Ignore;
        }
        let (old_root, old_space) = {
            let space = p.address_space().unwrap();
            (space.root(), Arc::downgrade(&space))
        };

        let result = m.run_as(0, &main, |pm| {
            pm.enter_kernel(&main);
            pm.execve(&user_program(), &["sh"], &["PATH=/bin"], Some("/bin/sh"))
        });

        assert_eq!(result, Ok(Ok(())));
        assert!(old_space.upgrade().is_none());
        assert!(m.paging.is_destroyed(old_root));
        let new_root = p.address_space().unwrap().root();
        assert!(m.paging.activations().contains(&(new_root, false)));

        assert_eq!(extra.state(), ThreadState::Dying);
        assert_eq!(p.thread_count(), 1);
        assert!(p.handles().get(STDOUT_HANDLE).is_none());
        assert!(p.handles().get(STDERR_HANDLE).is_some());
        assert_eq!(p.signal_handlers()[SIGUSR1 as usize].action, SignalAction::Default);
        assert_eq!(p.signal_handlers()[SIGINT as usize].action, SignalAction::Ignore);
        assert_eq!(p.name(), "sh");
        assert_eq!(main.context().gs_base, crate::config::ENVIRONMENT_BLOCK_BASE);
    }

    #[test]
    fn test_bad_image_keeps_old_image() {
        let m = machine(1);
        let p = m
            .manager
            .create_elf_process(&user_program(), &["old"], &[], None, None)
            .unwrap();
        let main = p.main_thread();
        let root = p.address_space().unwrap().root();

        let result = m.run_as(0, &main, |pm| pm.execve(b"#!/bin/sh\n", &["sh"], &[], None));

        assert_eq!(result, Ok(Err(PsError::Load(LoadError::BadMagic))));
        assert_eq!(p.address_space().unwrap().root(), root);
        assert_eq!(p.name(), "old");
        assert!(p.is_running());
    }
}
