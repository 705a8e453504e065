//! End-to-end record/replay scenarios. These drive the real binary against
//! freshly compiled C tracees, so they need a recording-capable host:
//! ptrace permission, a PMU exposing retired conditional branches, and a C
//! compiler. They are ignored by default; run with
//! `cargo test -- --ignored` on such a host.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn retrace_bin() -> &'static str {
    env!("CARGO_BIN_EXE_retrace")
}

struct Scenario {
    dir: tempfile::TempDir,
}

impl Scenario {
    fn new() -> Scenario {
        Scenario {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn compile(&self, name: &str, source: &str) -> PathBuf {
        let src = self.dir.path().join(format!("{}.c", name));
        let bin = self.dir.path().join(name);
        fs::write(&src, source).unwrap();
        let status = Command::new("cc")
            .arg("-o")
            .arg(&bin)
            .arg(&src)
            .status()
            .expect("cc not available");
        assert!(status.success(), "failed to compile {}", name);
        bin
    }

    fn trace_root(&self) -> PathBuf {
        self.dir.path().join("traces")
    }

    /// Record `bin`, returning (exit code, trace dir).
    fn record(&self, bin: &Path) -> (i32, PathBuf) {
        let status = Command::new(retrace_bin())
            .env("_RETRACE_TRACE_DIR", self.trace_root())
            .arg("record")
            .arg(bin)
            .status()
            .unwrap();
        let trace = self.trace_root().join("latest-trace");
        (status.code().unwrap_or(-1), trace)
    }

    /// Replay the latest trace with no debugger; returns the exit code.
    fn replay(&self) -> i32 {
        let status = Command::new(retrace_bin())
            .env("_RETRACE_TRACE_DIR", self.trace_root())
            .arg("replay")
            .arg("--autopilot")
            .status()
            .unwrap();
        status.code().unwrap_or(-1)
    }

    fn dump(&self) -> String {
        let out = Command::new(retrace_bin())
            .env("_RETRACE_TRACE_DIR", self.trace_root())
            .arg("dump")
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).into_owned()
    }
}

/// Scenario 1: pipe FIOCLEX/FIONCLEX round trip through the buffered-ioctl
/// path.
#[test]
#[ignore]
fn pipe_ioctl_cloexec_round_trip() {
    let s = Scenario::new();
    let bin = s.compile(
        "pipe_ioctl",
        r#"
#include <fcntl.h>
#include <sys/ioctl.h>
#include <unistd.h>
int main(void) {
  int fds[2];
  if (pipe(fds)) return 1;
  if (ioctl(fds[0], FIOCLEX, 0)) return 2;
  if (fcntl(fds[0], F_GETFD) != FD_CLOEXEC) return 3;
  if (ioctl(fds[0], FIONCLEX, 0)) return 4;
  if (fcntl(fds[0], F_GETFD) != 0) return 5;
  return 0;
}
"#,
    );
    let (code, _) = s.record(&bin);
    assert_eq!(code, 0);
    assert_eq!(s.replay(), 0);
    // The replayed trace visits the same observable syscall sequence.
    let dump = s.dump();
    assert!(dump.contains("ioctl"));
}

/// Scenario 2: raw clone with child-cleartid; the futex wake and the tid
/// clear must both replay.
#[test]
#[ignore]
fn clone_without_tls_cleartid() {
    let s = Scenario::new();
    let bin = s.compile(
        "clone_cleartid",
        r#"
#define _GNU_SOURCE
#include <linux/futex.h>
#include <sched.h>
#include <stdlib.h>
#include <sys/syscall.h>
#include <sys/wait.h>
#include <unistd.h>

static int child_tid;
static int child_tid_copy;
static char stack[65536];

static int child(void* arg) {
  child_tid_copy = child_tid;
  syscall(SYS_exit, 0);
  return 0;
}

int main(void) {
  int tid = clone(child, stack + sizeof(stack),
                  CLONE_VM | CLONE_FS | CLONE_FILES | CLONE_SIGHAND |
                      CLONE_THREAD | CLONE_SYSVSEM | CLONE_CHILD_CLEARTID,
                  0, 0, 0, &child_tid);
  if (tid < 0) return 1;
  child_tid = tid;
  while (child_tid != 0) {
    syscall(SYS_futex, &child_tid, FUTEX_WAIT, tid, 0, 0, 0);
  }
  if (child_tid != 0) return 2;
  return 0;
}
"#,
    );
    let (code, _) = s.record(&bin);
    assert_eq!(code, 0);
    assert_eq!(s.replay(), 0);
}

/// Scenario 3: mremap of a writable file mapping; the read-only alias must
/// observe writes through the remapped pages.
#[test]
#[ignore]
fn mremap_writable_file_mapping() {
    let s = Scenario::new();
    let bin = s.compile(
        "mremap_file",
        r#"
#include <fcntl.h>
#include <string.h>
#include <sys/mman.h>
#include <unistd.h>
int main(void) {
  int fd = open("/tmp/retrace-mremap-test", O_CREAT | O_TRUNC | O_RDWR, 0600);
  if (fd < 0) return 1;
  if (ftruncate(fd, 2 * 4096)) return 2;
  char* rw = mmap(0, 4096, PROT_READ | PROT_WRITE, MAP_SHARED, fd, 0);
  char* r = mmap(0, 4096, PROT_READ, MAP_SHARED, fd, 0);
  if (rw == MAP_FAILED || r == MAP_FAILED) return 3;
  rw = mremap(rw, 4096, 2 * 4096, MREMAP_MAYMOVE);
  if (rw == MAP_FAILED) return 4;
  memcpy(rw, "deterministic", 14);
  if (memcmp(r, "deterministic", 14)) return 5;
  unlink("/tmp/retrace-mremap-test");
  return 0;
}
"#,
    );
    let (code, _) = s.record(&bin);
    assert_eq!(code, 0);
    assert_eq!(s.replay(), 0);
}

/// Scenario 4: an RDTSC loop; each read's recorded value must come back
/// identical.
#[test]
#[ignore]
fn rdtsc_loop_replays_recorded_values() {
    let s = Scenario::new();
    let bin = s.compile(
        "rdtsc_loop",
        r#"
#include <stdint.h>
static inline uint64_t rdtsc(void) {
  uint32_t lo, hi;
  __asm__ __volatile__("rdtsc" : "=a"(lo), "=d"(hi));
  return ((uint64_t)hi << 32) | lo;
}
int main(void) {
  uint64_t prev = 0;
  for (int i = 0; i < 100; i++) {
    uint64_t now = rdtsc();
    if (now < prev) return 1;
    prev = now;
  }
  return 0;
}
"#,
    );
    let (code, _) = s.record(&bin);
    assert_eq!(code, 0);
    assert_eq!(s.replay(), 0);
}

/// Scenario 5: stack growth colliding with a MAP_FIXED mapping placed just
/// below the stack; the address-space model must stay consistent across the
/// faults.
#[test]
#[ignore]
fn stack_growth_into_fixed_mapping() {
    let s = Scenario::new();
    let bin = s.compile(
        "stack_growth",
        r#"
#include <signal.h>
#include <string.h>
#include <sys/mman.h>
#include <sys/resource.h>
#include <unistd.h>

static void (*volatile touch_all)(void);

static void big_frame(void) {
  char frame[2 * 1024 * 1024];
  for (unsigned i = 0; i < sizeof(frame); i += 4096) frame[i] = 1;
  (void)frame;
}

int main(void) {
  char* sp = (char*)&sp;
  void* fixed = mmap((void*)(((unsigned long)sp - 8 * 1024 * 1024) & ~0xfffUL),
                     4096, PROT_NONE, MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
                     -1, 0);
  if (fixed == MAP_FAILED) return 1;
  signal(SIGSEGV, SIG_DFL);
  big_frame();
  return 0;
}
"#,
    );
    let (code, _) = s.record(&bin);
    // The program may die of SIGSEGV when the growth hits the fixed page;
    // what matters is that replay reproduces whichever outcome happened.
    assert_eq!(s.replay(), code);
}

/// Scenario 6: a tracee that dup2s over every fd number; the engine's
/// reserved fds must survive, buffering must keep working, and the child's
/// exit status 77 must propagate.
#[test]
#[ignore]
fn protect_tracer_fds() {
    let s = Scenario::new();
    let bin = s.compile(
        "protect_fds",
        r#"
#include <fcntl.h>
#include <sys/wait.h>
#include <unistd.h>
int main(void) {
  long maxfd = sysconf(_SC_OPEN_MAX);
  for (int fd = 3; fd < maxfd && fd < 1024; fd++) {
    if (dup2(2, fd) >= 0) fcntl(fd, F_SETFD, FD_CLOEXEC);
  }
  int fds[2];
  if (pipe(fds)) return 1;
  if (write(fds[1], "x", 1) != 1) return 2;
  pid_t child = fork();
  if (child == 0) {
    execlp("/bin/sh", "sh", "-c", "exit 77", (char*)0);
    _exit(127);
  }
  int status = 0;
  waitpid(child, &status, 0);
  if (!WIFEXITED(status) || WEXITSTATUS(status) != 77) return 3;
  return 77;
}
"#,
    );
    let (code, _) = s.record(&bin);
    assert_eq!(code, 77);
    assert_eq!(s.replay(), 77);
}
