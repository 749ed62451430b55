/*
 * Kernel Logging System
 *
 * Implements the `log` facade for the kernel. Records go to the console sink
 * of the installed architecture backend, one line each:
 *
 *   [LEVEL] [cpuN] [pid:tid name] message
 *
 * The thread part appears once the scheduler is running something on the
 * logging CPU. Lines are serialized by an IrqLock so records from two cores
 * never interleave.
 */

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::Once;

use crate::arch;
use crate::scheduler::{self, CpuId, Thread};
use crate::sync::IrqLock;

/// Custom logger implementation for the kernel.
struct CluuLogger {
    level: LevelFilter,
    output: IrqLock<()>,
}

/// `fmt::Write` adapter over the architecture console
struct Console(&'static dyn arch::Arch);

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.console_write(s);
        Ok(())
    }
}

impl log::Log for CluuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(arch) = arch::try_get() else {
            return;
        };
        let cpu = arch.current_cpu();
        // Never spin on a queue lock here: the record may come from dispatch.
        let thread = scheduler::try_get().and_then(|sched| sched.try_current(cpu));

        let _line = self.output.lock();
        let _ = write_record(
            &mut Console(arch),
            record.level(),
            cpu,
            thread.as_deref(),
            record.args(),
        );
    }

    fn flush(&self) {}
}

fn write_record(
    out: &mut impl Write,
    level: log::Level,
    cpu: CpuId,
    thread: Option<&Thread>,
    args: &fmt::Arguments<'_>,
) -> fmt::Result {
    write!(out, "[{}] [{}] ", level, cpu)?;
    if let Some(thread) = thread {
        write!(out, "[{}:{} {}] ", thread.pid().0, thread.id().0, thread.name())?;
    }
    writeln!(out, "{}", args)
}

static LOGGER: Once<CluuLogger> = Once::new();

/// Install the kernel logger with `level` as the maximum level
///
/// Only the first call has an effect.
pub fn init(level: LevelFilter) {
    let mut installed = false;
    let logger = LOGGER.call_once(|| {
        installed = true;
        CluuLogger {
            level,
            output: IrqLock::new(()),
        }
    });
    if !installed {
        return;
    }
    match log::set_logger(logger) {
        Ok(()) => log::set_max_level(level),
        Err(err) => panic!("Error with initializing logger: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use crate::scheduler::ThreadEntry;
    use crate::testing::TestRig;

    #[test]
    fn test_record_without_thread() {
        let mut out = String::new();
        write_record(
            &mut out,
            log::Level::Warn,
            CpuId(2),
            None,
            &format_args!("stack low"),
        )
        .expect("write");
        assert_eq!(out, "[WARN] [cpu2] stack low\n");
    }

    #[test]
    fn test_log_reaches_console() {
        let mock = crate::testing::install_global_arch();
        let logger = CluuLogger {
            level: LevelFilter::Info,
            output: IrqLock::new(()),
        };
        log::Log::log(
            &logger,
            &Record::builder()
                .level(log::Level::Error)
                .args(format_args!("console sink check"))
                .build(),
        );
        // The thread part depends on what the global scheduler runs, if anything.
        assert!(mock.console().lines().any(|line| {
            line.starts_with("[ERROR] [cpu0] ") && line.ends_with("console sink check")
        }));

        log::Log::log(
            &logger,
            &Record::builder()
                .level(log::Level::Debug)
                .args(format_args!("filtered out"))
                .build(),
        );
        assert!(!mock.console().contains("filtered out"));
    }

    #[test]
    fn test_record_names_thread() {
        let rig = TestRig::new(1);
        let thread = rig.spawn_kernel_thread("worker", ThreadEntry::Kernel { arg: 0 });
        let mut out = String::new();
        write_record(
            &mut out,
            log::Level::Info,
            CpuId(0),
            Some(&thread),
            &format_args!("hello {}", 42),
        )
        .expect("write");
        assert_eq!(
            out,
            alloc::format!("[INFO] [cpu0] [0:{} worker] hello 42\n", thread.id().0)
        );
    }
}
