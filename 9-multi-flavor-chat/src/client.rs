use std::future::Future;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, protocol::write_line};

/// Relays terminal lines to the server and server lines to the terminal. The
/// server drives the conversation; the client only forwards text.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut server_lines, mut writer) = establish_connection(&args).await?;
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    run_client_loop(
        &mut server_lines,
        &mut writer,
        &mut stdin_lines,
        &mut stdout,
        tokio::signal::ctrl_c(),
    )
    .await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader).lines(), writer))
}

/// Both line sources use `Lines::next_line`, which keeps partial input
/// buffered when the other branch of the `select!` wins.
async fn run_client_loop<R, W, S, O, I>(
    server_lines: &mut Lines<R>,
    writer: &mut W,
    stdin_lines: &mut Lines<S>,
    stdout: &mut O,
    interrupt: I,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    I: Future<Output = io::Result<()>>,
{
    tokio::pin!(interrupt);
    loop {
        select! {
            server_line = server_lines.next_line() => {
                if !handle_server_line(server_line, stdout).await? {
                    break;
                }
            }
            input = stdin_lines.next_line() => {
                if !handle_stdin_input(input, writer).await? {
                    break;
                }
            }
            ctrl_c = &mut interrupt => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line<O>(line: io::Result<Option<String>>, stdout: &mut O) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    match line? {
        Some(line) => {
            write_out(stdout, &line).await?;
            Ok(true)
        }
        None => {
            write_out(stdout, "*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input<W>(input: io::Result<Option<String>>, writer: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(input) = input? else {
        return Ok(false);
    };

    write_line(writer, &input)
        .await
        .context("failed to send line to server")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_out<O>(stdout: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
