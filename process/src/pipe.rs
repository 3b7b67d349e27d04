use std::io::ErrorKind;
use std::process::Stdio;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::CommandVector;
use crate::errors::ExecError;
use crate::execute::StderrMode;

const LINE_CHANNEL_CAPACITY: usize = 256;

pub(crate) struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
    pub lines_rx: mpsc::Receiver<String>,
    pub readers: Vec<JoinHandle<()>>,
}

/// Reads `reader` until EOF and forwards every line without its trailing
/// newline. Invalid UTF-8 is replaced rather than dropped.
async fn read_lines<R>(reader: R, lines_tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if lines_tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Spawns `command` in its own process group with stdout (and optionally
/// stderr) captured line by line.
pub(crate) fn spawn_child(
    command: &CommandVector,
    stderr_mode: StderrMode,
) -> Result<SpawnedChild, ExecError> {
    let (program, args) = command
        .argv()
        .split_first()
        .filter(|(program, _)| !program.is_empty())
        .ok_or(ExecError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(cwd) = command.get_current_dir() {
        cmd.current_dir(cwd);
    }
    cmd.envs(command.get_envs());

    #[cfg(target_os = "linux")]
    let parent_pid = unsafe { libc::getpid() };
    unsafe {
        cmd.pre_exec(move || {
            crate::process_group::set_process_group()?;
            #[cfg(target_os = "linux")]
            crate::process_group::set_parent_death_signal(parent_pid)?;
            Ok(())
        });
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    match stderr_mode {
        StderrMode::Join => cmd.stderr(Stdio::piped()),
        StderrMode::Discard => cmd.stderr(Stdio::null()),
    };

    let mut child = cmd
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;
    let pid = child.id().ok_or_else(|| ExecError::Spawn {
        program: program.clone(),
        source: std::io::Error::other("missing child pid"),
    })?;

    let (lines_tx, lines_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(stdout, lines_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(stderr, lines_tx.clone())));
    }
    // The channel closes once every reader has hit EOF.
    drop(lines_tx);

    Ok(SpawnedChild {
        child,
        pid,
        lines_rx,
        readers,
    })
}
