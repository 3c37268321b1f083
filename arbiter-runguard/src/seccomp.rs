//! Syscall policy: a human-written allow-list compiled into a classic
//! BPF program and installed with `prctl(PR_SET_SECCOMP)`.

use crate::syscalls;

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use libc::sock_filter;
use serde::Deserialize;

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_ALU: u16 = 0x04;
const BPF_AND: u16 = 0x50;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_KILL: u32 = 0x0000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

// struct seccomp_data layout
const SECCOMP_DATA_NR: u32 = 0;
const SECCOMP_DATA_ARCH: u32 = 4;
const SECCOMP_DATA_ARGS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    /// Terminate the offender as if by SIGSYS.
    Kill,
    /// Fail the syscall with EPERM.
    Errno,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

fn default_rule_action() -> RuleAction {
    RuleAction::Allow
}

fn default_arg_mask() -> u32 {
    u32::MAX
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgOp {
    Eq,
    Ne,
}

/// Constraint on one syscall argument: the masked low dword is compared
/// against `value`.
#[derive(Debug, Clone, Deserialize)]
pub struct ArgRule {
    pub index: u8,
    #[serde(default = "default_arg_mask")]
    pub mask: u32,
    pub op: ArgOp,
    pub value: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyscallRule {
    pub syscall: String,
    #[serde(default = "default_rule_action")]
    pub action: RuleAction,
    #[serde(default, rename = "arg")]
    pub args: Vec<ArgRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeccompPolicy {
    #[serde(rename = "default")]
    pub default_action: DefaultAction,
    #[serde(default, rename = "rule")]
    pub rules: Vec<SyscallRule>,
}

impl SeccompPolicy {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read seccomp policy: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let policy: SeccompPolicy =
            toml::from_str(content).context("malformed seccomp policy")?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<()> {
        type ArgSignature = Vec<(u8, u32)>;
        let mut seen: HashMap<&str, Vec<(RuleAction, ArgSignature)>> = HashMap::new();

        for rule in &self.rules {
            for arg in &rule.args {
                if arg.index > 5 {
                    anyhow::bail!(
                        "syscall {}: argument index {} out of range",
                        rule.syscall,
                        arg.index
                    );
                }
            }

            let mut signature: ArgSignature =
                rule.args.iter().map(|a| (a.index, a.mask)).collect();
            signature.sort_unstable();

            let entries = seen.entry(rule.syscall.as_str()).or_default();
            for (action, other) in entries.iter() {
                if *action != rule.action && *other == signature {
                    anyhow::bail!(
                        "syscall {} has conflicting allow and deny rules at the same argument mask",
                        rule.syscall
                    );
                }
            }
            entries.push((rule.action, signature));
        }

        Ok(())
    }

    /// Compiles the policy to a BPF program. Rules are matched in policy
    /// order; a non-matching syscall falls through to the default action.
    pub fn compile(&self) -> Result<SeccompFilter> {
        let deny_ret = match self.default_action {
            DefaultAction::Kill => SECCOMP_RET_KILL,
            DefaultAction::Errno => {
                SECCOMP_RET_ERRNO | (libc::EPERM as u32 & SECCOMP_RET_DATA)
            }
        };

        let mut prog: Vec<sock_filter> = Vec::new();
        prog.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH));
        prog.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0));
        prog.push(bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL));

        for rule in &self.rules {
            let nr = syscalls::lookup(&rule.syscall)
                .with_context(|| format!("unknown syscall: {}", rule.syscall))?;

            let ret = match rule.action {
                RuleAction::Allow => SECCOMP_RET_ALLOW,
                RuleAction::Deny => deny_ret,
            };

            // Each block reloads the syscall number because argument
            // tests clobber the accumulator.
            let mut block: Vec<sock_filter> = Vec::new();
            block.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR));
            block.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 0));
            for arg in &rule.args {
                let offset = SECCOMP_DATA_ARGS + 8 * u32::from(arg.index);
                block.push(bpf_stmt(BPF_LD | BPF_W | BPF_ABS, offset));
                if arg.mask != u32::MAX {
                    block.push(bpf_stmt(BPF_ALU | BPF_AND | BPF_K, arg.mask));
                }
                block.push(bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, arg.value, 0, 0));
            }
            block.push(bpf_stmt(BPF_RET | BPF_K, ret));

            resolve_block_jumps(&mut block, &rule.args)?;
            prog.extend_from_slice(&block);
        }

        prog.push(bpf_stmt(BPF_RET | BPF_K, deny_ret));

        Ok(SeccompFilter { prog })
    }
}

/// Fixes up the conditional jumps inside one rule block so that a failed
/// comparison skips the rest of the block.
fn resolve_block_jumps(block: &mut [sock_filter], args: &[ArgRule]) -> Result<()> {
    let len = block.len();
    let to_end = |pos: usize| -> Result<u8> {
        let distance = len - pos - 1;
        u8::try_from(distance).map_err(|_| anyhow::anyhow!("seccomp rule too long"))
    };

    // syscall-number dispatch at index 1
    block[1].jf = to_end(1)?;

    let mut pos = 2;
    for arg in args {
        pos += 1; // the load
        if arg.mask != u32::MAX {
            pos += 1; // the mask
        }
        match arg.op {
            ArgOp::Eq => block[pos].jf = to_end(pos)?,
            ArgOp::Ne => block[pos].jt = to_end(pos)?,
        }
        pos += 1;
    }

    Ok(())
}

fn bpf_stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

pub struct SeccompFilter {
    prog: Vec<sock_filter>,
}

impl SeccompFilter {
    pub fn instructions(&self) -> &[sock_filter] {
        &self.prog
    }

    /// Installs the filter. Must be the last restriction applied in the
    /// child: afterwards even `execve` has to be allowed by the policy.
    pub fn load(&self) -> Result<()> {
        let fprog = libc::sock_fprog {
            len: self.prog.len() as u16,
            filter: self.prog.as_ptr() as *mut sock_filter,
        };

        crate::libc_call(|| unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) })
            .context("failed to set no_new_privs")?;

        crate::libc_call(|| unsafe {
            libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_FILTER, &fprog)
        })
        .context("failed to install seccomp filter")?;

        Ok(())
    }
}
