use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        Arc,
        mpsc::{self, Receiver, TryRecvError},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use super::{TriggerDetector, TriggerSource};
use crate::{errors::DaclError, shutdown::Shutdown, telemetry::WarningMailbox};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Quiet period after a button event before the button is looked at again.
pub const BUTTON_SETTLE: Duration = Duration::from_secs(1);

pub const BUTTON_LABEL: &str = "Manual Trigger";
pub const CONSOLE_LABEL: &str = "Manual Terminal";

/// Fires whenever the CAN listener has left a warning in the mailbox.
pub struct CanWarningDetector {
    mailbox: Arc<WarningMailbox>,
}

impl CanWarningDetector {
    pub fn new(mailbox: Arc<WarningMailbox>) -> Self {
        Self { mailbox }
    }
}

impl TriggerDetector for CanWarningDetector {
    fn source(&self) -> TriggerSource {
        TriggerSource::CanWarning
    }

    fn poll(&mut self, _shutdown: &Shutdown) -> Result<Option<String>, DaclError> {
        Ok(self.mailbox.take())
    }

    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }
}

/// A push button wired to a GPIO line.
pub trait ButtonInput: Send {
    fn is_pressed(&mut self) -> Result<bool, DaclError>;
}

/// Active-low button read through the sysfs GPIO interface.
pub struct SysfsButton {
    value_path: PathBuf,
}

impl SysfsButton {
    pub fn new(pin: u32) -> Self {
        Self::from_value_path(&PathBuf::from(format!("/sys/class/gpio/gpio{pin}/value")))
    }

    pub fn from_value_path(path: &Path) -> Self {
        Self {
            value_path: path.to_path_buf(),
        }
    }
}

impl ButtonInput for SysfsButton {
    fn is_pressed(&mut self) -> Result<bool, DaclError> {
        let value = fs::read_to_string(&self.value_path).map_err(|e| DaclError::GpioError {
            path: self.value_path.clone(),
            source: e,
        })?;
        Ok(value.trim() == "0")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonState {
    Armed { low_polls: u32 },
    WaitingForRelease,
}

/// Debounced button detector.
///
/// The line must read pressed on two consecutive polls to fire. After firing, the
/// detector waits out [`BUTTON_SETTLE`] and then for the button to be released, so a
/// held button produces a single event.
pub struct GpioDetector<B: ButtonInput> {
    button: B,
    state: ButtonState,
    settle: Duration,
}

impl<B: ButtonInput> GpioDetector<B> {
    pub fn new(button: B) -> Self {
        Self {
            button,
            state: ButtonState::Armed { low_polls: 0 },
            settle: BUTTON_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

impl<B: ButtonInput> TriggerDetector for GpioDetector<B> {
    fn source(&self) -> TriggerSource {
        TriggerSource::Gpio
    }

    fn poll(&mut self, _shutdown: &Shutdown) -> Result<Option<String>, DaclError> {
        let pressed = self.button.is_pressed()?;
        match self.state {
            ButtonState::Armed { low_polls } if pressed => {
                if low_polls + 1 >= 2 {
                    self.state = ButtonState::WaitingForRelease;
                    return Ok(Some(BUTTON_LABEL.to_string()));
                }
                self.state = ButtonState::Armed {
                    low_polls: low_polls + 1,
                };
            }
            ButtonState::Armed { .. } => self.state = ButtonState::Armed { low_polls: 0 },
            ButtonState::WaitingForRelease if !pressed => {
                debug!("Button released, re-arming");
                self.state = ButtonState::Armed { low_polls: 0 };
            }
            ButtonState::WaitingForRelease => {}
        }
        Ok(None)
    }

    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    fn after_fire(&mut self, shutdown: &Shutdown) {
        shutdown.sleep(self.settle);
    }
}

/// Operator keys typed on the console: `t` records an event, `e` exits.
pub struct ConsoleDetector {
    keys: Receiver<char>,
    closed: bool,
}

impl ConsoleDetector {
    pub fn new(keys: Receiver<char>) -> Self {
        Self {
            keys,
            closed: false,
        }
    }

    /// Reads the process stdin on a detached thread.
    ///
    /// The terminal stays in line mode, so keys take effect after Enter.
    pub fn from_stdin() -> Self {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            for byte in io::stdin().lock().bytes() {
                let Ok(byte) = byte else { break };
                if sender.send(byte as char).is_err() {
                    break;
                }
            }
        });
        Self::new(receiver)
    }
}

impl TriggerDetector for ConsoleDetector {
    fn source(&self) -> TriggerSource {
        TriggerSource::Console
    }

    fn poll(&mut self, shutdown: &Shutdown) -> Result<Option<String>, DaclError> {
        loop {
            match self.keys.try_recv() {
                Ok('t') | Ok('T') => return Ok(Some(CONSOLE_LABEL.to_string())),
                Ok('e') | Ok('E') => {
                    info!("Exit requested from console");
                    shutdown.trigger();
                    return Ok(None);
                }
                Ok(_) => {}
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        warn!("Console input closed, console trigger disabled");
                        self.closed = true;
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }
}
