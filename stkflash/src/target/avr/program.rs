//! Page programming over a synchronized connection.
//!
//! Every page is written as `LOAD_ADDRESS` followed by `PROG_PAGE`; the
//! load-address reply is read (or times out) before the page goes out, so
//! there is never more than one command in flight.

use crate::connection::SerialConnection;
use crate::error::{Error, Result};
use crate::image::HexImage;
use crate::port::Port;
use crate::progress::UploadSession;
use crate::protocol::stk500::{Command, PARM_SW_MAJOR, PARM_SW_MINOR, Reply, hex_dump, parse_reply};
use log::{debug, info, warn};
use std::time::Duration;

/// Word addresses are 16 bits wide.
const MAX_FLASH_BYTES: usize = 0x2_0000;

/// What to do when a command is not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum AckPolicy {
    /// Log a warning, count the miss and keep going.
    #[default]
    Lenient,
    /// Fail the upload.
    Strict,
}

/// Reply timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramTimeouts {
    /// `LOAD_ADDRESS` acknowledgement.
    pub address_ack: Duration,
    /// `PROG_PAGE` acknowledgement (includes the flash write time).
    pub page_ack: Duration,
    /// Other commands.
    pub command_ack: Duration,
}

impl Default for ProgramTimeouts {
    fn default() -> Self {
        Self {
            address_ack: Duration::from_millis(150),
            page_ack: Duration::from_millis(500),
            command_ack: Duration::from_millis(200),
        }
    }
}

/// Result of a page run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramReport {
    /// Pages written.
    pub pages: usize,
    /// Commands that went unacknowledged under the lenient policy.
    pub missed_acks: usize,
}

/// Sends STK500v1 commands on an already synchronized connection.
pub struct PageProgrammer<'a, P: Port> {
    conn: &'a mut SerialConnection<P>,
    page_size: usize,
    policy: AckPolicy,
    timeouts: ProgramTimeouts,
    missed_acks: usize,
}

impl<'a, P: Port> PageProgrammer<'a, P> {
    /// Create a programmer writing `page_size` byte pages.
    pub fn new(conn: &'a mut SerialConnection<P>, page_size: usize) -> Self {
        Self {
            conn,
            page_size,
            policy: AckPolicy::default(),
            timeouts: ProgramTimeouts::default(),
            missed_acks: 0,
        }
    }

    /// Set the acknowledgement policy.
    #[must_use]
    pub fn with_policy(mut self, policy: AckPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the reply timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ProgramTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Send one command and classify whatever comes back within `timeout`.
    pub fn command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
        session: &mut UploadSession<'_>,
    ) -> Result<Reply> {
        let payload_len = command.reply_len();
        self.conn.write_all(&command.build())?;
        let data = self
            .conn
            .read_until(timeout, |b| parse_reply(b, payload_len).is_complete())?;
        session.debug(format!(
            "cmd 0x{:02X}: RX [{}]",
            command.opcode(),
            hex_dump(&data)
        ));
        Ok(parse_reply(&data, payload_len))
    }

    /// Apply the ack policy to a reply.
    fn check(&mut self, reply: &Reply, page: Option<usize>, what: &str) -> Result<()> {
        if reply.is_ok() {
            return Ok(());
        }
        let reason = format!("{what}: {}", describe(reply));
        match (self.policy, page) {
            (AckPolicy::Strict, Some(page)) => Err(Error::PageProgramFailure { page, reason }),
            (AckPolicy::Strict, None) => Err(Error::Protocol(reason)),
            (AckPolicy::Lenient, _) => {
                self.missed_acks += 1;
                match page {
                    Some(page) => warn!("Page {page}: {reason}, continuing"),
                    None => warn!("{reason}, continuing"),
                }
                Ok(())
            },
        }
    }

    /// Enter programming mode.
    pub fn enter_progmode(&mut self, session: &mut UploadSession<'_>) -> Result<()> {
        let reply = self.command(Command::EnterProgMode, self.timeouts.command_ack, session)?;
        self.check(&reply, None, "enter programming mode")
    }

    /// Leave programming mode, which starts the application. The reply is
    /// read but not checked; many bootloaders jump away before answering.
    pub fn leave_progmode(&mut self, session: &mut UploadSession<'_>) -> Result<()> {
        let reply = self.command(Command::LeaveProgMode, self.timeouts.command_ack, session)?;
        if !reply.is_ok() {
            debug!("Leave programming mode: {}", describe(&reply));
        }
        Ok(())
    }

    /// Write every page of `image`.
    pub fn program(
        &mut self,
        image: &HexImage,
        session: &mut UploadSession<'_>,
    ) -> Result<ProgramReport> {
        let total = image.page_count(self.page_size);
        if total * self.page_size > MAX_FLASH_BYTES {
            return Err(Error::Unsupported(format!(
                "image of {} bytes exceeds the {} KiB addressable by STK500v1",
                image.len(),
                MAX_FLASH_BYTES / 1024
            )));
        }
        info!(
            "Writing {} bytes in {total} page(s) of {} bytes",
            image.len(),
            self.page_size
        );

        for page in 0..total {
            session.checkpoint()?;
            session.begin_page(page);

            let byte_address = page * self.page_size;
            let word_address = u16::try_from(byte_address / 2).map_err(|_| {
                Error::PageProgramFailure {
                    page,
                    reason: format!("byte address 0x{byte_address:X} out of range"),
                }
            })?;

            let reply = self.command(
                Command::LoadAddress(word_address),
                self.timeouts.address_ack,
                session,
            )?;
            self.check(&reply, Some(page), "load address not acknowledged")?;

            let data = image.page(page, self.page_size);
            let reply = self.command(
                Command::ProgramPage(&data),
                self.timeouts.page_ack,
                session,
            )?;
            self.check(&reply, Some(page), "page write not acknowledged")?;

            debug!("Page {page} written at word 0x{word_address:04X}");
            session.page_written(page, total);
        }

        Ok(ProgramReport {
            pages: total,
            missed_acks: self.missed_acks,
        })
    }

    /// Read the three signature bytes.
    pub fn read_signature(&mut self, session: &mut UploadSession<'_>) -> Result<[u8; 3]> {
        match self.command(Command::ReadSignature, self.timeouts.command_ack, session)? {
            Reply::Ok(sig) if sig.len() == 3 => Ok([sig[0], sig[1], sig[2]]),
            Reply::Missing => Err(Error::Timeout(format!(
                "no signature within {} ms",
                self.timeouts.command_ack.as_millis()
            ))),
            other => Err(Error::Protocol(format!(
                "read signature: {}",
                describe(&other)
            ))),
        }
    }

    /// Read the bootloader software version as `(major, minor)`.
    pub fn software_version(&mut self, session: &mut UploadSession<'_>) -> Result<(u8, u8)> {
        let major = self.parameter(PARM_SW_MAJOR, session)?;
        let minor = self.parameter(PARM_SW_MINOR, session)?;
        Ok((major, minor))
    }

    fn parameter(&mut self, param: u8, session: &mut UploadSession<'_>) -> Result<u8> {
        match self.command(Command::GetParameter(param), self.timeouts.command_ack, session)? {
            Reply::Ok(value) if value.len() == 1 => Ok(value[0]),
            Reply::Missing => Err(Error::Timeout(format!(
                "parameter 0x{param:02X} not answered within {} ms",
                self.timeouts.command_ack.as_millis()
            ))),
            other => Err(Error::Protocol(format!(
                "get parameter 0x{param:02X}: {}",
                describe(&other)
            ))),
        }
    }
}

fn describe(reply: &Reply) -> String {
    match reply {
        Reply::Ok(_) => "ok".to_string(),
        Reply::Failed => "bootloader reported failure".to_string(),
        Reply::NoSync => "bootloader lost sync".to_string(),
        Reply::Missing => "no reply".to_string(),
        Reply::Malformed(data) => format!("unexpected reply [{}]", hex_dump(data)),
    }
}
