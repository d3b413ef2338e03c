use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use tlaunch::launch::shell::{RemoteShell, ShellFuture, ShellOutput};

/// Scripted stand-in for ssh + tmux. Sessions hold panes with fake pids;
/// `kill -0` succeeds while a pane's session is alive.
#[derive(Default)]
pub struct FakeShell {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Vec<String>>,
    sessions: BTreeMap<String, Vec<(u32, String)>>,
    dead: HashSet<u32>,
    next_pid: u32,
    current_session: Option<String>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends a session named `name` is already running.
    pub fn with_session(self, name: &str) -> Self {
        {
            let mut state = self.state.lock().expect("fake shell mutex poisoned");
            let pid = state.allocate_pid();
            state
                .sessions
                .insert(name.to_string(), vec![(pid, "zsh".to_string())]);
        }
        self
    }

    /// Session that `display-message -p '#S'` reports, as if asked from one
    /// of its panes.
    pub fn enter_session(&self, name: &str) {
        self.state
            .lock()
            .expect("fake shell mutex poisoned")
            .current_session = Some(name.to_string());
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .expect("fake shell mutex poisoned")
            .calls
            .clone()
    }

    /// Calls whose remote command uses `subcommand`, e.g. `new-window`.
    pub fn calls_for(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| remote_words(argv).iter().any(|word| word == subcommand))
            .collect()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("fake shell mutex poisoned")
            .sessions
            .keys()
            .cloned()
            .collect()
    }
}

impl FakeState {
    fn allocate_pid(&mut self) -> u32 {
        self.next_pid += 1;
        1_000 + self.next_pid
    }

    fn run(&mut self, argv: &[String]) -> ShellOutput {
        self.calls.push(argv.to_vec());
        let words = remote_words(argv);
        let words: Vec<&str> = words.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["kill", "-0", pid] => match pid.parse::<u32>() {
                Ok(pid) if self.is_alive(pid) => ok(""),
                _ => failed("No such process"),
            },
            [_, "new-session", rest @ ..] => {
                let name = flag(rest, "-s").unwrap_or_default();
                if self.sessions.contains_key(&name) {
                    return failed(&format!("duplicate session: {name}"));
                }
                let pid = self.allocate_pid();
                self.sessions.insert(name, vec![(pid, "zsh".to_string())]);
                ok("")
            }
            [_, "new-window", rest @ ..] => {
                let session = flag(rest, "-t").unwrap_or_default();
                let title = flag(rest, "-n").unwrap_or_default();
                let pid = self.allocate_pid();
                match self.sessions.get_mut(&session) {
                    Some(panes) => {
                        panes.push((pid, title));
                        ok("")
                    }
                    None => failed(&format!("can't find session: {session}")),
                }
            }
            [_, "list-panes", rest @ ..] => {
                let session = flag(rest, "-t").unwrap_or_default();
                match self.sessions.get(&session) {
                    Some(panes) => ok(&panes
                        .iter()
                        .map(|(pid, window)| format!("{pid} {window}\n"))
                        .collect::<String>()),
                    None => failed(&format!("can't find session: {session}")),
                }
            }
            [_, "kill-session", "-t", name] => match self.sessions.remove(*name) {
                Some(panes) => {
                    self.dead.extend(panes.into_iter().map(|(pid, _)| pid));
                    ok("")
                }
                None => failed(&format!("can't find session: {name}")),
            },
            [_, "display-message", "-p", "#S"] => match &self.current_session {
                Some(name) if self.sessions.contains_key(name) => ok(&format!("{name}\n")),
                _ => failed("no current client"),
            },
            [_, "ls"] => ok(&self
                .sessions
                .iter()
                .map(|(name, panes)| format!("{name}: {} windows\n", panes.len()))
                .collect::<String>()),
            [_, "kill-server"] => {
                let panes: Vec<u32> = self
                    .sessions
                    .values()
                    .flatten()
                    .map(|(pid, _)| *pid)
                    .collect();
                self.dead.extend(panes);
                self.sessions.clear();
                ok("")
            }
            _ => failed(&format!("unexpected command {argv:?}")),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.contains(&pid)
            && self
                .sessions
                .values()
                .flatten()
                .any(|(pane, _)| *pane == pid)
    }
}

impl RemoteShell for FakeShell {
    fn run<'a>(&'a self, argv: &'a [String]) -> ShellFuture<'a> {
        Box::pin(async move {
            let output = self
                .state
                .lock()
                .expect("fake shell mutex poisoned")
                .run(argv);
            Ok(output)
        })
    }
}

/// The command as the target host would see it: ssh wrapping is peeled off
/// and the remote line split back into words.
pub fn remote_words(argv: &[String]) -> Vec<String> {
    if argv.first().map(String::as_str) != Some("ssh") {
        return argv.to_vec();
    }
    argv.last()
        .map(|line| {
            line.split_whitespace()
                .map(|word| word.trim_matches('\'').to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn flag(words: &[&str], name: &str) -> Option<String> {
    words
        .iter()
        .position(|word| *word == name)
        .and_then(|index| words.get(index + 1))
        .map(|value| value.to_string())
}

fn ok(stdout: &str) -> ShellOutput {
    ShellOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> ShellOutput {
    ShellOutput {
        status: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}
