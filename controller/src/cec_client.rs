use std::{
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use log::{debug, error, warn};

use crate::bus::{AlertHandler, BusAlert, BusLink, LogicalAddress, PowerStatus};

/// Opening can take a while because cec-client polls the whole bus first
const OPEN_TIMEOUT: Duration = Duration::from_secs(15);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const QUIT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct CecClient {
    program: PathBuf,
    /// Put in front of cec-client's own arguments
    prefix_args: Vec<String>,
    device_name: String,
    verbose: bool,
    running: Option<Running>,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
    /// Set before we make cec-client exit, so that isn't reported as a lost connection
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl CecClient {
    pub fn new(program: impl Into<PathBuf>, device_name: &str, verbose: bool) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            device_name: device_name.into(),
            verbose,
            running: None,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.prefix_args);
        command
    }

    fn send(&mut self, line: &str) -> anyhow::Result<()> {
        let running = self.running.as_mut().ok_or(anyhow!("CEC adapter is not open"))?;
        writeln!(running.stdin, "{line}").context("Error writing to cec-client")?;
        running.stdin.flush().context("Error flushing cec-client input")?;
        Ok(())
    }
}

impl BusLink for CecClient {
    fn discover(&mut self) -> anyhow::Result<Vec<String>> {
        let output = self
            .command()
            .arg("-l")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("Error running {:?}", self.program))?;
        Ok(parse_adapters(&String::from_utf8_lossy(&output.stdout)))
    }

    fn open(&mut self, address: &str, alerts: AlertHandler) -> anyhow::Result<()> {
        self.close();
        let log_level = if self.verbose { "31" } else { "1" };
        let mut child = self
            .command()
            .args(["-t", "p", "-d", log_level, "-o", self.device_name.as_str(), address])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Error starting {:?}", self.program))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("cec-client has no stdin or stdout");
        };
        let (tx, lines) = mpsc::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let reader = thread::Builder::new().name("cec-client".into()).spawn({
            let closing = closing.clone();
            let verbose = self.verbose;
            move || read_lines(stdout, tx, closing, alerts, verbose)
        });
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e).context("Error starting cec-client reader");
            }
        };
        let running = Running {
            child,
            stdin,
            lines,
            closing,
            reader,
        };
        match wait_until_ready(&running.lines) {
            Ok(()) => {
                self.running = Some(running);
                Ok(())
            }
            Err(e) => {
                running.shut_down();
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if let Some(running) = self.running.take() {
            running.shut_down();
        }
    }

    fn power_on(&mut self, device: LogicalAddress) -> anyhow::Result<()> {
        self.send(&format!("on {device}"))
    }

    fn standby(&mut self, device: LogicalAddress) -> anyhow::Result<()> {
        self.send(&format!("standby {device}"))
    }

    fn query_power_status(&mut self, device: LogicalAddress) -> PowerStatus {
        let Some(running) = self.running.as_mut() else {
            return PowerStatus::Unknown;
        };
        // Whatever earlier commands printed
        while running.lines.try_recv().is_ok() {}
        if let Err(e) = writeln!(running.stdin, "pow {device}").and_then(|()| running.stdin.flush())
        {
            warn!("Error asking for power status: {e}");
            return PowerStatus::Unknown;
        }
        let give_up = Instant::now() + REPLY_TIMEOUT;
        loop {
            match running
                .lines
                .recv_timeout(give_up.saturating_duration_since(Instant::now()))
            {
                Ok(line) => {
                    if let Some(status) = parse_power_status(&line) {
                        return status;
                    }
                }
                Err(_) => {
                    warn!("No power status reply from cec-client");
                    return PowerStatus::Unknown;
                }
            }
        }
    }
}

impl Drop for CecClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl Running {
    fn shut_down(mut self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = writeln!(self.stdin, "q").and_then(|()| self.stdin.flush());
        let give_up = Instant::now() + QUIT_TIMEOUT;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < give_up => thread::sleep(Duration::from_millis(50)),
                _ => {
                    warn!("cec-client didn't quit, killing it");
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        if self.reader.join().is_err() {
            error!("cec-client reader panicked");
        }
    }
}

fn read_lines(
    stdout: ChildStdout,
    tx: Sender<String>,
    closing: Arc<AtomicBool>,
    alerts: AlertHandler,
    verbose: bool,
) {
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else { break };
        if verbose {
            debug!("cec-client: {line}");
        }
        if tx.send(line).is_err() {
            break;
        }
    }
    if !closing.load(Ordering::SeqCst) {
        warn!("cec-client exited");
        alerts(BusAlert::ConnectionLost);
    }
}

fn wait_until_ready(lines: &Receiver<String>) -> anyhow::Result<()> {
    let give_up = Instant::now() + OPEN_TIMEOUT;
    loop {
        match lines.recv_timeout(give_up.saturating_duration_since(Instant::now())) {
            Ok(line) if line.contains("waiting for input") => return Ok(()),
            Ok(line) if line.contains("unable to open") || line.contains("could not open") => {
                bail!("cec-client: {line}")
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => bail!("Timed out waiting for cec-client to connect"),
            Err(RecvTimeoutError::Disconnected) => bail!("cec-client exited while connecting"),
        }
    }
}

/// Gets every `com port:` from `cec-client -l`, in the order listed
pub fn parse_adapters(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("com port:"))
        .map(|port| port.trim().to_string())
        .filter(|port| !port.is_empty())
        .collect()
}

pub fn parse_power_status(line: &str) -> Option<PowerStatus> {
    let (_, status) = line.split_once("power status:")?;
    Some(match status.trim() {
        "on" => PowerStatus::On,
        "standby" => PowerStatus::Off,
        _ => PowerStatus::Unknown,
    })
}
