//! Builds restore files and pipes them into iptables-restore style commands
//!
//! A restore file is a buffer of lines, each optionally tagged with a section
//! id and carrying its own error handlers. When the command rejects the file
//! we first check for errors that mean the whole file is worth retrying, then
//! extract the failing 1-based line number from stderr and let that line's
//! handlers decide what to omit before the next try.

use regex::Regex;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{Level, event};

use warden::Error;

/// What a matched line failure handler omits before the next try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineErrorRule {
    /// Omit the failing line and every line before it
    Continue,
    /// Omit the failing line, every line before it, and the rest of its section
    ContinueAndAbortSection,
}

/// A per-line reaction to a command failure
pub struct ErrorHandler {
    /// The pattern stderr must match for this handler to fire
    regex: Regex,
    /// What to omit when this handler fires
    rule: LineErrorRule,
    /// Bookkeeping to run before the retry (reference counts etc)
    callback: Option<Box<dyn FnMut() + Send>>,
}

impl ErrorHandler {
    /// Create a new error handler
    ///
    /// # Arguments
    ///
    /// * `pattern` - The pattern stderr must match for this handler to fire
    /// * `rule` - What to omit when this handler fires
    pub fn new(pattern: &str, rule: LineErrorRule) -> Result<Self, Error> {
        Ok(ErrorHandler {
            regex: Regex::new(pattern)?,
            rule,
            callback: None,
        })
    }

    /// Attach bookkeeping to run before the retry
    ///
    /// # Arguments
    ///
    /// * `callback` - The bookkeeping to run
    pub fn with_callback<F: FnMut() + Send + 'static>(mut self, callback: F) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

/// One line of a restore file
struct Line {
    /// The text of this line
    content: String,
    /// The section this line belongs to if any
    section: Option<String>,
    /// The handlers consulted when this line fails
    handlers: Vec<ErrorHandler>,
    /// Whether this line has been omitted by an earlier failure
    omitted: bool,
}

/// The output of a piped command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// The exit code if the command exited at all
    pub code: Option<i32>,
    /// The captured stdout
    pub stdout: String,
    /// The captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited cleanly
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands with a file piped to stdin
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command, piping a file to its stdin
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command to run
    /// * `args` - The args to pass to the command
    /// * `stdin` - The file contents to pipe in
    async fn run(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput, Error>;
}

#[async_trait::async_trait]
impl<T: CommandRunner> CommandRunner for std::sync::Arc<T> {
    async fn run(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput, Error> {
        self.as_ref().run(cmd, args, stdin).await
    }
}

/// Runs real commands through tokio
#[derive(Default)]
pub struct ExecRunner;

#[async_trait::async_trait]
impl CommandRunner for ExecRunner {
    /// Run a command, piping a file to its stdin
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command to run
    /// * `args` - The args to pass to the command
    /// * `stdin` - The file contents to pipe in
    async fn run(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput, Error> {
        // spawn the command with all three pipes captured
        let mut child = tokio::process::Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // pipe the file into the command
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes()).await?;
            // drop the pipe so the command sees EOF
            drop(pipe);
        }
        // wait for the command to finish
        let out = child.wait_with_output().await?;
        Ok(CommandOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// Builds a restore file and retries it with partial omission on failures
pub struct FileCreator {
    /// The lines of the file in order
    lines: Vec<Line>,
    /// Patterns that mean the whole file is worth retrying as is
    file_level_patterns: Vec<Regex>,
    /// Patterns extracting the failing 1-based line number from stderr
    line_failure_patterns: Vec<Regex>,
    /// How many times to try the file before giving up
    max_try_count: usize,
}

impl FileCreator {
    /// Create a new file creator
    ///
    /// # Arguments
    ///
    /// * `max_try_count` - How many times to try the file before giving up
    /// * `line_failure_patterns` - Patterns extracting failing line numbers from stderr
    pub fn new(max_try_count: usize, line_failure_patterns: &[&str]) -> Result<Self, Error> {
        let line_failure_patterns = line_failure_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<Regex>, regex::Error>>()?;
        Ok(FileCreator {
            lines: Vec::default(),
            file_level_patterns: Vec::default(),
            line_failure_patterns,
            max_try_count,
        })
    }

    /// Add a pattern that means the whole file is worth retrying as is
    ///
    /// # Arguments
    ///
    /// * `pattern` - The pattern stderr must match
    pub fn add_file_level_pattern(&mut self, pattern: &str) -> Result<(), Error> {
        self.file_level_patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Add a line to the file
    ///
    /// # Arguments
    ///
    /// * `section` - The section this line belongs to if any
    /// * `handlers` - The handlers consulted when this line fails
    /// * `content` - The text of the line
    pub fn add_line<T: Into<String>>(
        &mut self,
        section: Option<&str>,
        handlers: Vec<ErrorHandler>,
        content: T,
    ) {
        self.lines.push(Line {
            content: content.into(),
            section: section.map(ToOwned::to_owned),
            handlers,
            omitted: false,
        });
    }

    /// Whether any lines survive in this file
    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|line| line.omitted)
    }

    /// Build the current file contents from the non-omitted lines
    pub fn build(&self) -> String {
        let mut file = String::new();
        for line in self.lines.iter().filter(|line| !line.omitted) {
            file.push_str(&line.content);
            file.push('\n');
        }
        file
    }

    /// Run a command with this file piped in, retrying with omission on errors
    ///
    /// An empty file is a success without running anything. Exhausting the try
    /// count returns a non retriable error.
    ///
    /// # Arguments
    ///
    /// * `runner` - The runner executing the command
    /// * `cmd` - The command to run
    /// * `args` - The args to pass to the command
    pub async fn run(
        &mut self,
        runner: &dyn CommandRunner,
        cmd: &str,
        args: &[String],
    ) -> Result<(), Error> {
        for attempt in 1..=self.max_try_count {
            // nothing left to apply means we are done
            if self.is_empty() {
                return Ok(());
            }
            let file = self.build();
            let out = runner.run(cmd, args, &file).await?;
            if out.success() {
                return Ok(());
            }
            event!(
                Level::WARN,
                cmd,
                attempt,
                stderr = %out.stderr.trim(),
                "restore file failed"
            );
            // the last attempt gets no recovery pass
            if attempt == self.max_try_count {
                return Err(Error::RestoreFailed {
                    tries: attempt,
                    stderr: out.stderr,
                });
            }
            // try file level recovery first, then line level omission
            if self.matches_file_level(&out.stderr) {
                continue;
            }
            self.handle_line_failure(&out.stderr, attempt)?;
        }
        // an empty file never runs at all
        Ok(())
    }

    /// Whether stderr matches any whole-file retry pattern
    ///
    /// # Arguments
    ///
    /// * `stderr` - The stderr from the failed command
    fn matches_file_level(&self, stderr: &str) -> bool {
        self.file_level_patterns
            .iter()
            .any(|pattern| pattern.is_match(stderr))
    }

    /// Omit lines based on the failing line number in stderr
    ///
    /// # Arguments
    ///
    /// * `stderr` - The stderr from the failed command
    /// * `tries` - How many tries have happened so far
    fn handle_line_failure(&mut self, stderr: &str, tries: usize) -> Result<(), Error> {
        // extract the 1-based failing line number from stderr
        let line_num = self
            .line_failure_patterns
            .iter()
            .find_map(|pattern| pattern.captures(stderr))
            .and_then(|caps| caps.get(1))
            .and_then(|group| group.as_str().parse::<usize>().ok())
            .ok_or_else(|| Error::RestoreFailed {
                tries,
                stderr: stderr.to_owned(),
            })?;
        // map the number onto the not yet omitted lines
        let live: Vec<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, line)| !line.omitted)
            .map(|(index, _)| index)
            .collect();
        if line_num == 0 || line_num > live.len() {
            return Err(Error::RestoreFailed {
                tries,
                stderr: format!("line {line_num} is out of bounds: {stderr}"),
            });
        }
        let failed = live[line_num - 1];
        // consult the failing line's own handlers
        let matched = self.lines[failed]
            .handlers
            .iter_mut()
            .find(|handler| handler.regex.is_match(stderr));
        let Some(handler) = matched else {
            return Err(Error::RestoreFailed {
                tries,
                stderr: stderr.to_owned(),
            });
        };
        let rule = handler.rule;
        // bookkeeping fires before the retry
        if let Some(callback) = &mut handler.callback {
            callback();
        }
        // omit the failing line and everything before it
        for line in self.lines.iter_mut().take(failed + 1) {
            line.omitted = true;
        }
        // an aborted section loses its remaining lines too
        if rule == LineErrorRule::ContinueAndAbortSection {
            if let Some(section) = self.lines[failed].section.clone() {
                for line in self.lines.iter_mut() {
                    if line.section.as_deref() == Some(section.as_str()) {
                        line.omitted = true;
                    }
                }
            }
        }
        event!(
            Level::INFO,
            line = line_num,
            rule = ?rule,
            "omitted failing restore lines before retry"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// A runner that replays scripted outputs and records piped files
    struct ScriptedRunner {
        /// The outputs to hand out in order
        outputs: Mutex<Vec<CommandOutput>>,
        /// The files piped to each run
        files: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        /// Create a runner from scripted outputs
        fn new(outputs: Vec<CommandOutput>) -> Self {
            ScriptedRunner {
                outputs: Mutex::new(outputs),
                files: Mutex::new(Vec::default()),
            }
        }

        /// Build a failing output with stderr
        fn fail(stderr: &str) -> CommandOutput {
            CommandOutput {
                code: Some(1),
                stdout: String::default(),
                stderr: stderr.to_owned(),
            }
        }

        /// Build a clean output
        fn ok() -> CommandOutput {
            CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _cmd: &str,
            _args: &[String],
            stdin: &str,
        ) -> Result<CommandOutput, Error> {
            self.files.lock().await.push(stdin.to_owned());
            let mut outputs = self.outputs.lock().await;
            if outputs.is_empty() {
                return Ok(ScriptedRunner::ok());
            }
            Ok(outputs.remove(0))
        }
    }

    /// Build a creator matching `line N failed` errors
    fn creator(max: usize) -> FileCreator {
        FileCreator::new(max, &[r"line (\d+) failed"]).unwrap()
    }

    #[tokio::test]
    async fn empty_files_never_run() {
        let runner = ScriptedRunner::new(vec![ScriptedRunner::fail("boom")]);
        let mut creator = creator(3);
        creator.run(&runner, "ipset", &[]).await.unwrap();
        assert!(runner.files.lock().await.is_empty());
    }

    #[tokio::test]
    async fn line_failures_omit_earlier_lines() {
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::fail("Error: line 2 failed: set does not exist"),
            ScriptedRunner::ok(),
        ]);
        let mut creator = creator(3);
        creator.add_line(None, Vec::default(), "create a hash:ip");
        creator.add_line(
            None,
            vec![
                ErrorHandler::new("does not exist", LineErrorRule::Continue).unwrap(),
            ],
            "add a 10.0.0.1",
        );
        creator.add_line(None, Vec::default(), "create b hash:ip");
        creator.run(&runner, "ipset", &[]).await.unwrap();
        let files = runner.files.lock().await;
        assert_eq!(files.len(), 2);
        // the retry only carries the line after the omitted prefix
        assert_eq!(files[1], "create b hash:ip\n");
    }

    #[tokio::test]
    async fn aborted_sections_lose_their_remaining_lines() {
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::fail("Error: line 2 failed: set is in use"),
            ScriptedRunner::ok(),
        ]);
        let mut creator = creator(3);
        creator.add_line(Some("a"), Vec::default(), "flush a");
        creator.add_line(
            Some("a"),
            vec![
                ErrorHandler::new("in use", LineErrorRule::ContinueAndAbortSection).unwrap(),
            ],
            "destroy a",
        );
        creator.add_line(Some("b"), Vec::default(), "flush b");
        creator.add_line(Some("a"), Vec::default(), "add a 10.0.0.1");
        creator.run(&runner, "ipset", &[]).await.unwrap();
        let files = runner.files.lock().await;
        // the trailing line of section a is gone but section b survives
        assert_eq!(files[1], "flush b\n");
    }

    #[tokio::test]
    async fn callbacks_fire_before_the_retry() {
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::fail("Error: line 1 failed: cannot add"),
            ScriptedRunner::ok(),
        ]);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let mut creator = creator(3);
        creator.add_line(
            None,
            vec![
                ErrorHandler::new("cannot add", LineErrorRule::Continue)
                    .unwrap()
                    .with_callback(move || {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }),
            ],
            "add a 10.0.0.1",
        );
        creator.add_line(None, Vec::default(), "add b 10.0.0.2");
        creator.run(&runner, "ipset", &[]).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_level_patterns_retry_everything() {
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::fail("another app is currently holding the xtables lock"),
            ScriptedRunner::ok(),
        ]);
        let mut creator = creator(3);
        creator.add_file_level_pattern("xtables lock").unwrap();
        creator.add_line(None, Vec::default(), "-A FORWARD -j AZURE-NPM");
        creator.run(&runner, "iptables-restore", &[]).await.unwrap();
        let files = runner.files.lock().await;
        assert_eq!(files.len(), 2);
        // nothing was omitted between tries
        assert_eq!(files[0], files[1]);
    }

    #[tokio::test]
    async fn exhaustion_is_not_retriable() {
        let runner = ScriptedRunner::new(vec![
            ScriptedRunner::fail("another app is currently holding the xtables lock"),
            ScriptedRunner::fail("another app is currently holding the xtables lock"),
            ScriptedRunner::fail("another app is currently holding the xtables lock"),
        ]);
        let mut creator = creator(3);
        creator.add_file_level_pattern("xtables lock").unwrap();
        creator.add_line(None, Vec::default(), "-A FORWARD -j AZURE-NPM");
        let out = creator.run(&runner, "iptables-restore", &[]).await;
        match out {
            Err(Error::RestoreFailed { tries, .. }) => assert_eq!(tries, 3),
            other => panic!("expected RestoreFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_errors_fail_immediately() {
        let runner = ScriptedRunner::new(vec![ScriptedRunner::fail("total nonsense")]);
        let mut creator = creator(5);
        creator.add_line(None, Vec::default(), "add a 10.0.0.1");
        let out = creator.run(&runner, "ipset", &[]).await;
        assert!(matches!(out, Err(Error::RestoreFailed { .. })));
        // only one try happened even though more were allowed
        assert_eq!(runner.files.lock().await.len(), 1);
    }
}
