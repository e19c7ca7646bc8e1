//! Documentation generator seam and the external-command implementation.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context};

use wikisync_core::config::GeneratorConfig;

use crate::workspace::Workspace;

/// Bytes of generator stderr kept in the error message.
const STDERR_TAIL: usize = 2048;

/// Produces wiki content for one language variant of a prepared workspace.
pub trait WikiGenerator: Send + Sync {
    /// Generate the catalog and every document from scratch.
    fn generate_full(&self, workspace: &Workspace, language: &str) -> anyhow::Result<()>;

    /// Regenerate only what `changed_files` affects.
    fn apply_incremental(
        &self,
        workspace: &Workspace,
        language: &str,
        changed_files: &[String],
    ) -> anyhow::Result<()>;
}

/// Runs a configured program once per language variant.
///
/// The program receives `WIKISYNC_*` environment variables describing the
/// run and the changed paths on stdin, one per line. A non-zero exit status
/// fails the run.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(argv: &[String]) -> anyhow::Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("generator command is empty");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// `None` when no generator command is configured.
    pub fn from_config(config: &GeneratorConfig) -> anyhow::Result<Option<Self>> {
        config.command.as_deref().map(Self::new).transpose()
    }

    fn run(
        &self,
        mode: &str,
        workspace: &Workspace,
        language: &str,
        changed_files: &[String],
    ) -> anyhow::Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&workspace.working_directory)
            .env("WIKISYNC_MODE", mode)
            .env("WIKISYNC_WORKSPACE", &workspace.working_directory)
            .env("WIKISYNC_LANGUAGE", language)
            .env("WIKISYNC_COMMIT", &workspace.commit_id)
            .env(
                "WIKISYNC_PREVIOUS_COMMIT",
                workspace.previous_commit_id.as_deref().unwrap_or_default(),
            )
            .env(
                "WIKISYNC_REPOSITORY",
                format!("{}/{}", workspace.organization, workspace.repository_name),
            )
            .env("WIKISYNC_BRANCH", &workspace.branch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start generator '{}'", self.program))?;

        let input: String = changed_files.iter().map(|path| format!("{path}\n")).collect();
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                // A generator that ignores stdin may close it early.
                let _ = stdin.write_all(input.as_bytes());
            })
        });

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for generator '{}'", self.program))?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "generator '{}' exited with {}: {}",
                self.program,
                output.status,
                tail(stderr.trim(), STDERR_TAIL)
            );
        }
        tracing::debug!(
            program = %self.program,
            mode,
            language,
            files = changed_files.len(),
            "generator finished"
        );
        Ok(())
    }
}

impl WikiGenerator for CommandGenerator {
    fn generate_full(&self, workspace: &Workspace, language: &str) -> anyhow::Result<()> {
        self.run("full", workspace, language, &[])
    }

    fn apply_incremental(
        &self,
        workspace: &Workspace,
        language: &str,
        changed_files: &[String],
    ) -> anyhow::Result<()> {
        self.run("incremental", workspace, language, changed_files)
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
