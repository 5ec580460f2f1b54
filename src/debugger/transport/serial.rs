use crate::debugger::transport::{recv_ticking, Transport, READ_TICK};
use log::debug;
use nix::libc;
use nix::sys::termios;
use nix::sys::termios::{BaudRate, SetArg};
use std::fs::{File, OpenOptions};
use std::io;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use timeout_readwrite::TimeoutReader;

/// Serial character device (an UART, or an RFCOMM Bluetooth link bound to a tty).
pub struct SerialTransport {
    device: PathBuf,
    reader: TimeoutReader<File>,
    writer: File,
}

fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    let rate = match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {baud}"),
            ))
        }
    };
    Ok(rate)
}

impl SerialTransport {
    /// Open `device` in raw mode. Baud rate is ignored by RFCOMM ttys but must still be valid.
    pub fn open(device: &Path, baud: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(device)?;

        let mut attrs = termios::tcgetattr(&file)?;
        termios::cfmakeraw(&mut attrs);
        termios::cfsetspeed(&mut attrs, baud_rate(baud)?)?;
        termios::tcsetattr(&file, SetArg::TCSANOW, &attrs)?;
        termios::tcflush(&file, termios::FlushArg::TCIOFLUSH)?;

        debug!(target: "transport", "serial device {} opened at {baud} baud", device.display());
        Ok(Self {
            device: device.to_path_buf(),
            writer: file.try_clone()?,
            reader: TimeoutReader::new(file, READ_TICK),
        })
    }
}

impl Transport for SerialTransport {
    fn describe(&self) -> String {
        format!("serial {}", self.device.display())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        recv_ticking(&mut self.reader, buf, timeout)
    }
}
