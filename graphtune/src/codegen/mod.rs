//! Building and running kernels on the local CPU with Clang.
//!
//! Each configuration is turned into a standalone C program: the knob values become `KNOB_*`
//! macros, followed by the task's kernel source and a benchmarking `main`. The program takes the
//! number of inner iterations (and optionally a cache-flush flag) on the command line and prints
//! the loop's runtime as `cpu: <s>s <ns>ns`.

mod clang;

pub use clang::clang_path;

use crate::common::TargetId;
use crate::measure::{BuildError, Builder, Device, PipelineError, RunError, RunOptions};
use crate::space::{Configuration, KnobValue};
use crate::task::Task;
use crate::utils::indent;

use log::debug;
use std::fmt::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CLI_FLAGS: [&str; 3] = ["-std=gnu99", "-rtlib=compiler-rt", "-o"];

const X86_CLI_VEC_FLAGS: [&str; 1] = ["-mavx2"];
const ARM_CLI_VEC_FLAGS: [&str; 0] = [];

/// Bytes touched between timed runs when flushing caches. Larger than any last-level cache we
/// expect to meet.
const FLUSH_BYTES: usize = 64 << 20;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct ClangBuilder {
    target: TargetId,
    opt_level: u8,
}

/// A compiled benchmark binary. The containing directory is deleted on drop.
pub struct BuiltArtifact {
    binary_path: PathBuf,
    _dir: TempDir,
}

/// The machine we are running on, treated as one device.
pub struct LocalCpuDevice {
    name: String,
}

impl ClangBuilder {
    pub fn new(target: TargetId, opt_level: u8) -> Self {
        ClangBuilder {
            target,
            opt_level: opt_level.min(3),
        }
    }

    fn cli_vec_flags(&self) -> &'static [&'static str] {
        match self.target {
            TargetId::X86 => &X86_CLI_VEC_FLAGS,
            TargetId::Arm => &ARM_CLI_VEC_FLAGS,
        }
    }
}

impl Builder for ClangBuilder {
    type Artifact = BuiltArtifact;

    fn build(&self, task: &Task, config: &Configuration) -> Result<BuiltArtifact, BuildError> {
        // A mismatch holds for every configuration of the task, so the session cannot proceed.
        if task.target() != self.target {
            return Err(PipelineError::TargetUnreachable(format!(
                "task {} targets {} but the builder targets {}",
                task.name(),
                task.target(),
                self.target
            ))
            .into());
        }
        let Some(kernel_source) = task.source() else {
            return Err(BuildError::Failed(format!(
                "task {} has no kernel source",
                task.name()
            )));
        };

        let mut program = String::new();
        emit_program(config, kernel_source, &mut program)
            .map_err(|e| BuildError::Failed(e.to_string()))?;

        let dir = tempfile::tempdir().map_err(PipelineError::from)?;
        let source_path = dir.path().join("main.c");
        let binary_path = dir.path().join("a.out");
        std::fs::write(&source_path, program).map_err(PipelineError::from)?;

        let clang_proc = Command::new(clang::compiler_path()?)
            .args(self.cli_vec_flags())
            .arg(format!("-O{}", self.opt_level))
            .args(CLI_FLAGS)
            .arg(&binary_path)
            .arg(&source_path)
            .output()
            .map_err(|e| PipelineError::TargetUnreachable(format!("cannot run clang: {e}")))?;

        if !clang_proc.status.success() {
            return Err(BuildError::Failed(format!(
                "Clang exited with {}\n{}",
                clang_proc.status,
                String::from_utf8_lossy(&clang_proc.stderr)
            )));
        }
        if !clang_proc.stderr.is_empty() {
            debug!(
                "Clang warnings for {config}:\n{}",
                String::from_utf8_lossy(&clang_proc.stderr)
            );
        }

        Ok(BuiltArtifact {
            binary_path,
            _dir: dir,
        })
    }
}

impl BuiltArtifact {
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

impl LocalCpuDevice {
    pub fn new(name: impl Into<String>) -> Self {
        LocalCpuDevice { name: name.into() }
    }
}

impl Default for LocalCpuDevice {
    fn default() -> Self {
        LocalCpuDevice::new("local-cpu")
    }
}

impl Device for LocalCpuDevice {
    type Artifact = BuiltArtifact;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, artifact: &BuiltArtifact, options: &RunOptions) -> Result<Duration, RunError> {
        let mut child = Command::new(&artifact.binary_path)
            .arg(options.number.to_string())
            .arg(if options.flush_cache { "1" } else { "0" })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RunError::Failed(format!("cannot start benchmark: {e}")))?;

        let deadline = Instant::now() + options.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    // The child may exit between try_wait and kill; either way it is gone after wait.
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunError::Timeout(options.timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(RunError::Failed(e.to_string())),
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| RunError::Failed(e.to_string()))?;
        if !output.status.success() {
            return Err(RunError::Failed(format!(
                "benchmark exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or("");
        let total = parse_benchmark_output(first_line).map_err(RunError::Failed)?;
        Ok(total / options.number.max(1))
    }
}

/// The C macro name for a knob: `KNOB_` followed by the upper-cased name, with anything that is
/// not alphanumeric replaced by `_`.
fn knob_macro_name(knob: &str) -> String {
    let mut name = String::from("KNOB_");
    name.extend(knob.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    name
}

fn emit_program<W: Write>(config: &Configuration, kernel_source: &str, out: &mut W) -> fmt::Result {
    writeln!(out, "// Configuration {config}")?;
    writeln!(out, "#include <stdio.h>")?;
    writeln!(out, "#include <stdlib.h>")?;
    writeln!(out, "#include <time.h>")?;
    writeln!(out)?;
    for (knob, value) in config.values() {
        let value = match value {
            KnobValue::Int(v) => v.to_string(),
            KnobValue::Bool(v) => u8::from(*v).to_string(),
            KnobValue::Str(v) => v.clone(),
        };
        writeln!(out, "#define {} {}", knob_macro_name(knob), value)?;
    }
    writeln!(out)?;
    writeln!(out, "{}", kernel_source.trim_end())?;
    writeln!(out)?;
    emit_benchmarking_main(out)
}

fn emit_benchmarking_main<W: Write>(out: &mut W) -> fmt::Result {
    let mut depth = 0;
    writeln!(out, "static volatile char flush_buffer[{FLUSH_BYTES}];")?;
    writeln!(out)?;
    writeln!(out, "int main(int argc, char *argv[]) {{")?;
    depth += 1;
    writeln!(
        out,
        "{}const long long bench_samples = argc > 1 ? atoll(argv[1]) : 1;",
        indent(depth)
    )?;
    writeln!(
        out,
        "{}const int flush = argc > 2 && atoi(argv[2]) != 0;",
        indent(depth)
    )?;
    writeln!(out, "{}if (flush) {{", indent(depth))?;
    writeln!(
        out,
        "{}for (size_t i = 0; i < sizeof(flush_buffer); i += 64) flush_buffer[i] = (char)i;",
        indent(depth + 1)
    )?;
    writeln!(out, "{}}}", indent(depth))?;
    writeln!(out, "{}struct timespec start, end;", indent(depth))?;
    writeln!(out, "{}clock_gettime(CLOCK_MONOTONIC, &start);", indent(depth))?;
    writeln!(out, "#pragma clang loop unroll(disable)")?; // preprocessor directives should not have indentation.
    writeln!(
        out,
        "{}for (long long bench_itr = 0; bench_itr < bench_samples; ++bench_itr) {{",
        indent(depth)
    )?;
    writeln!(out, "{}kernel();", indent(depth + 1))?;
    writeln!(out, "{}}}", indent(depth))?;
    writeln!(out, "{}clock_gettime(CLOCK_MONOTONIC, &end);", indent(depth))?;
    writeln!(
        out,
        "{}long long sec = (long long)(end.tv_sec - start.tv_sec);",
        indent(depth)
    )?;
    writeln!(
        out,
        "{}long long nsec = (long long)(end.tv_nsec - start.tv_nsec);",
        indent(depth)
    )?;
    writeln!(
        out,
        "{}if (nsec < 0) {{ sec -= 1; nsec += 1000000000LL; }}",
        indent(depth)
    )?;
    writeln!(
        out,
        "{}printf(\"cpu: %llds %lldns\\n\", sec, nsec);",
        indent(depth)
    )?;
    writeln!(out, "{}return 0;", indent(depth))?;
    depth -= 1;
    debug_assert_eq!(depth, 0);
    writeln!(out, "}}")
}

fn parse_benchmark_output(output: &str) -> Result<Duration, String> {
    let mut outs = output.split_whitespace();
    if outs.next() != Some("cpu:") {
        return Err("expected \"cpu:\" prefix in benchmark output".to_string());
    }

    let s_str = outs.next().ok_or("invalid output format")?;
    let ns_str = outs.next().ok_or("invalid output format")?;
    if !s_str.ends_with('s') || !ns_str.ends_with("ns") {
        return Err("invalid time unit".to_string());
    }

    let s = s_str.trim_end_matches('s');
    let ns = ns_str.trim_end_matches("ns");
    let s = s.parse::<u64>().map_err(|e| e.to_string())?;
    let ns = ns.parse::<u32>().map_err(|e| e.to_string())?;
    Ok(Duration::new(s, ns))
}
