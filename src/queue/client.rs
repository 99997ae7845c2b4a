//! Minimal beanstalkd client.
//!
//! Speaks the beanstalkd text protocol over one TCP connection. Commands are
//! strictly request/response, so the client takes `&mut self` and callers
//! that share it must serialize access.
//!
//! Transport failures map to [`BellError::QueueConnection`]; negative broker
//! replies map to [`BellError::QueueProtocol`].

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::trace;

use crate::{BellError, Result};

/// A reserved job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub body: Vec<u8>,
}

/// Connection to a beanstalkd broker
#[derive(Debug)]
pub struct BeanstalkClient {
    stream: BufStream<TcpStream>,
}

impl BeanstalkClient {
    /// Open a connection to `addr` (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            BellError::queue_connection_failed_with_source(format!("connect to {addr}"), e)
        })?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream: BufStream::new(stream) })
    }

    /// Select the tube that `put` publishes into.
    pub async fn use_tube(&mut self, tube: &str) -> Result<String> {
        let command = format!("use {tube}");
        let line = self.command(&command, None).await?;
        match split_reply(&line) {
            ("USING", Some(name)) => Ok(name.to_string()),
            _ => Err(BellError::queue_rejected(command, line)),
        }
    }

    /// Add a tube to the watch list. Returns the number of watched tubes.
    pub async fn watch(&mut self, tube: &str) -> Result<u32> {
        let command = format!("watch {tube}");
        let line = self.command(&command, None).await?;
        parse_watching(&command, line)
    }

    /// Remove a tube from the watch list. Returns the number of watched tubes.
    pub async fn ignore(&mut self, tube: &str) -> Result<u32> {
        let command = format!("ignore {tube}");
        let line = self.command(&command, None).await?;
        parse_watching(&command, line)
    }

    /// Put a job into the used tube. Returns the job id.
    pub async fn put(&mut self, priority: u32, delay: u32, ttr: u32, body: &[u8]) -> Result<u64> {
        let command = format!("put {priority} {delay} {ttr} {}", body.len());
        let line = self.command(&command, Some(body)).await?;
        match split_reply(&line) {
            ("INSERTED", Some(id)) => parse_id(&command, id, &line),
            _ => Err(BellError::queue_rejected("put", line)),
        }
    }

    /// Reserve a job from the watched tubes, waiting as long as it takes.
    pub async fn reserve(&mut self) -> Result<Job> {
        let line = self.command("reserve", None).await?;
        self.read_reserved("reserve", line)
            .await?
            .ok_or_else(|| BellError::queue_rejected("reserve", "TIMED_OUT"))
    }

    /// Reserve a job, giving up after `seconds`. `Ok(None)` on timeout.
    pub async fn reserve_with_timeout(&mut self, seconds: u32) -> Result<Option<Job>> {
        let command = format!("reserve-with-timeout {seconds}");
        let line = self.command(&command, None).await?;
        self.read_reserved(&command, line).await
    }

    /// Delete a job.
    pub async fn delete(&mut self, id: u64) -> Result<()> {
        self.expect(&format!("delete {id}"), "DELETED").await
    }

    /// Put a reserved job back into the ready queue.
    pub async fn release(&mut self, id: u64, priority: u32, delay: u32) -> Result<()> {
        self.expect(&format!("release {id} {priority} {delay}"), "RELEASED").await
    }

    /// Bury a reserved job.
    pub async fn bury(&mut self, id: u64, priority: u32) -> Result<()> {
        self.expect(&format!("bury {id} {priority}"), "BURIED").await
    }

    /// Request more time to work on a reserved job.
    pub async fn touch(&mut self, id: u64) -> Result<()> {
        self.expect(&format!("touch {id}"), "TOUCHED").await
    }

    /// Resolve once the broker closes the connection, fails it, or sends
    /// bytes no command asked for.
    ///
    /// Cancel safe: no reply data is consumed, so a command may follow.
    pub async fn lost(&mut self) -> BellError {
        match self.stream.fill_buf().await {
            Ok([]) => BellError::queue_connection_failed("broker closed the connection"),
            Ok(unsolicited) => BellError::queue_connection_failed(format!(
                "{} unsolicited bytes from broker",
                unsolicited.len()
            )),
            Err(e) => transport_error(e),
        }
    }

    async fn expect(&mut self, command: &str, ok: &str) -> Result<()> {
        let line = self.command(command, None).await?;
        if line == ok { Ok(()) } else { Err(BellError::queue_rejected(command, line)) }
    }

    async fn read_reserved(&mut self, command: &str, line: String) -> Result<Option<Job>> {
        if line == "TIMED_OUT" {
            return Ok(None);
        }

        let mut parts = line.split(' ');
        let (Some("RESERVED"), Some(id), Some(len), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BellError::queue_rejected(command, line));
        };
        let id = parse_id(command, id, &line)?;
        let len: usize = len.parse().map_err(|_| BellError::queue_rejected(command, &line))?;

        let mut body = vec![0u8; len + 2];
        self.stream.read_exact(&mut body).await.map_err(transport_error)?;
        if !body.ends_with(b"\r\n") {
            return Err(BellError::queue_rejected(command, "job body not terminated by CRLF"));
        }
        body.truncate(len);
        Ok(Some(Job { id, body }))
    }

    /// Send one command (plus optional body) and read the reply line.
    async fn command(&mut self, command: &str, body: Option<&[u8]>) -> Result<String> {
        trace!("beanstalkd <- {}", command);
        self.stream.write_all(command.as_bytes()).await.map_err(transport_error)?;
        self.stream.write_all(b"\r\n").await.map_err(transport_error)?;
        if let Some(body) = body {
            self.stream.write_all(body).await.map_err(transport_error)?;
            self.stream.write_all(b"\r\n").await.map_err(transport_error)?;
        }
        self.stream.flush().await.map_err(transport_error)?;

        let mut line = Vec::new();
        let n = self.stream.read_until(b'\n', &mut line).await.map_err(transport_error)?;
        if n == 0 {
            return Err(BellError::queue_connection_failed("broker closed the connection"));
        }
        let line = String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string();
        trace!("beanstalkd -> {}", line);
        Ok(line)
    }
}

fn transport_error(e: std::io::Error) -> BellError {
    BellError::queue_connection_failed_with_source("broker i/o", e)
}

fn split_reply(line: &str) -> (&str, Option<&str>) {
    match line.split_once(' ') {
        Some((word, rest)) => (word, Some(rest)),
        None => (line, None),
    }
}

fn parse_id(command: &str, id: &str, line: &str) -> Result<u64> {
    id.parse().map_err(|_| BellError::queue_rejected(command, line))
}

fn parse_watching(command: &str, line: String) -> Result<u32> {
    match split_reply(&line) {
        ("WATCHING", Some(count)) => {
            count.parse().map_err(|_| BellError::queue_rejected(command, &line))
        }
        _ => Err(BellError::queue_rejected(command, line)),
    }
}
