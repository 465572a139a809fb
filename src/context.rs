use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{load_config, Config};
use crate::error::Result;
use crate::paths::{default_global_dir, StorageLocator};
use crate::ports::{OsPortProbe, PortProbe};
use crate::runner::{SystemRunner, ToolRunner};
use crate::supervisor::{resolve_editor, Editor, Tmux};
use crate::worktree::Git;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns `start`, then advances by `step` on every call.
#[cfg(test)]
pub struct SteppingClock {
    next: std::cell::Cell<DateTime<Utc>>,
    step: chrono::Duration,
}

#[cfg(test)]
impl SteppingClock {
    pub fn new(start: DateTime<Utc>, step: chrono::Duration) -> Self {
        Self {
            next: std::cell::Cell::new(start),
            step,
        }
    }
}

#[cfg(test)]
impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let now = self.next.get();
        self.next.set(now + self.step);
        now
    }
}

/// Everything a verb needs, resolved once per invocation.
pub struct Context {
    pub cwd: PathBuf,
    pub locator: StorageLocator,
    pub config: Config,
    pub clock: Box<dyn Clock>,
    pub runner: Box<dyn ToolRunner>,
    pub ports: Box<dyn PortProbe>,
    pub json: bool,
    pub inside_tmux: bool,
    pub env_lookup: fn(&str) -> Option<String>,
}

fn process_env(var: &str) -> Option<String> {
    env::var(var).ok()
}

impl Context {
    pub fn from_process(json: bool) -> Result<Self> {
        let cwd = env::current_dir()?;
        let locator = StorageLocator::discover(&cwd, default_global_dir());
        let config = load_config(&locator)?;
        tracing::debug!(
            project_dir = ?locator.project_dir(),
            global_dir = %locator.global_dir().display(),
            "resolved storage"
        );
        Ok(Self {
            cwd,
            locator,
            config,
            clock: Box::new(SystemClock),
            runner: Box::new(SystemRunner),
            ports: Box::new(OsPortProbe),
            json,
            inside_tmux: env::var_os("TMUX").is_some_and(|v| !v.is_empty()),
            env_lookup: process_env,
        })
    }

    pub fn git(&self) -> Git<'_> {
        Git::new(self.runner.as_ref())
    }

    pub fn tmux(&self) -> Tmux<'_> {
        Tmux::new(
            self.runner.as_ref(),
            self.inside_tmux,
            Duration::from_millis(self.config.tmux_settle_ms),
        )
    }

    pub fn editor(&self) -> Editor<'_> {
        Editor::new(
            self.runner.as_ref(),
            resolve_editor(&self.config.editor, self.env_lookup),
        )
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::runner::testing::FakeRunner;
    use chrono::TimeZone;
    use std::cell::Cell;
    use std::path::Path;
    use std::rc::Rc;

    /// Hands out a fixed sequence of ports.
    pub struct SequentialProbe(pub Cell<u16>);

    impl PortProbe for SequentialProbe {
        fn free_port(&self) -> std::io::Result<u16> {
            let port = self.0.get();
            self.0.set(port + 1);
            Ok(port)
        }
    }

    /// Lets a test keep inspecting the fake after handing it to a context.
    pub struct SharedRunner(pub Rc<FakeRunner>);

    impl ToolRunner for SharedRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            opts: &crate::runner::RunOptions,
        ) -> std::io::Result<crate::runner::CommandOutput> {
            self.0.run(program, args, opts)
        }

        fn spawn_detached(&self, program: &str, args: &[String], cwd: &Path) -> std::io::Result<u32> {
            self.0.spawn_detached(program, args, cwd)
        }

        fn run_attached(&self, program: &str, args: &[String]) -> std::io::Result<i32> {
            self.0.run_attached(program, args)
        }

        fn on_path(&self, program: &str) -> bool {
            self.0.on_path(program)
        }
    }

    pub fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    pub fn test_context(cwd: &Path, global_dir: &Path, runner: Rc<FakeRunner>) -> Context {
        let config = Config {
            disable_caddy: true,
            tmux_settle_ms: 0,
            ..Config::default()
        };
        Context {
            cwd: cwd.to_path_buf(),
            locator: StorageLocator::discover(cwd, global_dir.to_path_buf()),
            config,
            clock: Box::new(SteppingClock::new(epoch(), chrono::Duration::seconds(1))),
            runner: Box::new(SharedRunner(runner)),
            ports: Box::new(SequentialProbe(Cell::new(41000))),
            json: false,
            inside_tmux: false,
            env_lookup: no_env,
        }
    }
}
