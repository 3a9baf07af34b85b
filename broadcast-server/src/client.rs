use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tracing::debug;

use crate::{cli::ConnectArgs, session::read_line};

/// How a client session came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// The server closed the connection or reading from it failed.
    Disconnected,
    /// Local input reached end of file.
    InputClosed,
}

pub async fn run(args: &ConnectArgs) -> Result<ClientExit> {
    let address = format!("{}:{}", args.host, args.port);
    let stream = TcpStream::connect(&address)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;

    let mut stdout = io::stdout();
    stdout
        .write_all(
            format!(
                "Connected to broadcast server at {address}\n\
                 Type your messages and press Enter to send. Press Ctrl+C to exit.\n"
            )
            .as_bytes(),
        )
        .await?;
    stdout.flush().await?;

    let (reader, writer) = stream.into_split();
    relay(reader, writer, io::stdin(), stdout).await
}

/// Prints inbound lines on a spawned task while local input is forwarded from
/// this one. The read half belongs to the printer and the write half to the
/// forwarder, so the two never share state.
pub async fn relay<R, W, I, O>(inbound: R, outbound: W, input: I, output: O) -> Result<ClientExit>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let mut printer = tokio::spawn(print_inbound(inbound, output));

    select! {
        printed = &mut printer => {
            printed.context("inbound printer panicked")??;
            Ok(ClientExit::Disconnected)
        }
        forwarded = forward_input(input, outbound) => {
            printer.abort();
            forwarded?;
            Ok(ClientExit::InputClosed)
        }
    }
}

async fn print_inbound<R, O>(inbound: R, mut output: O) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut inbound = BufReader::new(inbound);
    let mut line = Vec::new();

    loop {
        match read_line(&mut inbound, &mut line).await {
            Ok(true) => {
                output.write_all(b">> ").await?;
                output.write_all(&line).await?;
                output.flush().await?;
            }
            Ok(false) => break,
            Err(error) => {
                debug!(?error, "read from server failed");
                break;
            }
        }
    }

    output.write_all(b"\nDisconnected from server\n").await?;
    output.flush().await
}

async fn forward_input<I, W>(input: I, mut outbound: W) -> Result<()>
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = BufReader::new(input);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = input.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Ok(());
        }

        let text = trim_line_ending(&line);
        if text.is_empty() {
            continue;
        }

        let mut message = Vec::with_capacity(text.len() + 1);
        message.extend_from_slice(text);
        message.push(b'\n');
        outbound
            .write_all(&message)
            .await
            .context("failed to send message")?;
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, duplex},
        time::timeout,
    };

    use super::*;

    #[test]
    fn line_endings_are_stripped() {
        assert_eq!(trim_line_ending(b"hello\r\n"), b"hello");
        assert_eq!(trim_line_ending(b"hello\n"), b"hello");
        assert_eq!(trim_line_ending(b"hello"), b"hello");
        assert_eq!(trim_line_ending(b"\n"), b"");
    }

    #[tokio::test]
    async fn input_lines_are_sent_and_empty_ones_skipped() {
        let (mut server, client) = duplex(1024);
        let (_, outbound) = tokio::io::split(client);
        let input: &[u8] = b"hello\n\n\r\nworld\r\nno newline";

        forward_input(input, outbound).await.unwrap();

        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"hello\nworld\nno newline\n");
    }

    #[tokio::test]
    async fn server_disconnect_ends_the_relay() {
        let (mut server, client) = duplex(1024);
        let (inbound, outbound) = tokio::io::split(client);
        let (output, mut screen) = duplex(1024);
        // Input that never produces a line keeps the forwarder waiting.
        let (_keep_open, input) = duplex(16);

        server.write_all(b"hi there\n").await.unwrap();
        drop(server);

        let exit = timeout(Duration::from_secs(1), relay(inbound, outbound, input, output))
            .await
            .expect("relay should end when the server goes away")
            .unwrap();
        assert_eq!(exit, ClientExit::Disconnected);

        let mut printed = Vec::new();
        screen.read_to_end(&mut printed).await.unwrap();
        assert_eq!(printed, b">> hi there\n\nDisconnected from server\n");
    }
}
