//! Verb implementations.
//!
//! Each verb opens one adapter, does its work, and closes the adapter on every
//! path. Running out of messages is not a failure: the verb just stops.

use std::future::Future;
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::args::{
    Cli, Commands, ManageCommand, PublishArgs, ReceiveArgs, RequestArgs, SendArgs, SubscribeArgs,
};
use super::output::{destination_table, stats_lines, stdin_is_terminal, Render};
use crate::backends::{self, BackendError, Manageable, QueueBackend, TopicBackend};
use crate::config::Config;
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};
use crate::request::{Request, RequestOptions};

// ============================================================================
// Plumbing
// ============================================================================

/// Where rendered output goes.
pub struct Output<'a> {
    pub out: &'a mut (dyn Write + Send),
    pub err: &'a mut (dyn Write + Send),
}

/// Run `fut` unless Ctrl-C arrives first.
async fn interruptible<T>(fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        value = fut => Some(value),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            None
        }
    }
}

/// Seconds from the command line as a duration.
fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| BackendError::Config(format!("invalid timeout '{}'", value)).into())
}

/// Combine the verb outcome with the close outcome. The verb error wins.
fn finish(result: Result<()>, closed: backends::Result<()>) -> Result<()> {
    match (result, closed) {
        (Err(e), Err(close)) => {
            warn!(error = %close, "Close failed after error");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), closed) => closed.context("closing backend"),
    }
}

/// Read the whole of stdin, refusing to block on a terminal.
pub fn read_stdin() -> Result<Vec<u8>> {
    if stdin_is_terminal() {
        bail!("no message provided and no data in stdin");
    }
    let mut data = Vec::new();
    std::io::stdin()
        .read_to_end(&mut data)
        .context("reading stdin")?;
    Ok(data)
}

/// Payloads to send.
///
/// With `lines`, every input line becomes one message and `count` is ignored.
/// Otherwise the argument (or all of `input`) is repeated `count` times.
pub fn payloads(
    message: Option<&str>,
    lines: bool,
    count: u32,
    input: impl FnOnce() -> Result<Vec<u8>>,
) -> Result<Vec<Vec<u8>>> {
    if lines {
        let data = match message {
            Some(text) => text.as_bytes().to_vec(),
            None => input()?,
        };
        let mut split: Vec<Vec<u8>> = data
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
            .collect();
        if split.last().is_some_and(|l| l.is_empty()) {
            split.pop();
        }
        return Ok(split);
    }

    let data = match message {
        Some(text) => text.as_bytes().to_vec(),
        None => input()?,
    };
    Ok(vec![data; count as usize])
}

// ============================================================================
// Entry point
// ============================================================================

/// Execute the parsed command line against a loaded config.
pub async fn run(cli: Cli, config: Config) -> Result<()> {
    let verbose = cli.connection.verbose;
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let mut output = Output {
        out: &mut stdout,
        err: &mut stderr,
    };

    match cli.command {
        Commands::Send(args) => {
            let data = payloads(args.message.as_deref(), args.lines, args.count, read_stdin)?;
            let mut backend = backends::connect_queue(&config).await?;
            let result = send(backend.as_mut(), &args, data).await.map(|_| ());
            finish(result, backend.close().await)
        }
        Commands::Receive(args) => {
            let mut backend = backends::connect_queue(&config).await?;
            let result = receive(backend.as_mut(), &args, true, verbose, &mut output)
                .await
                .map(|_| ());
            finish(result, backend.close().await)
        }
        Commands::Peek(args) => {
            let mut backend = backends::connect_queue(&config).await?;
            let result = receive(backend.as_mut(), &args, false, verbose, &mut output)
                .await
                .map(|_| ());
            finish(result, backend.close().await)
        }
        Commands::Request(args) => {
            let data = payloads(args.message.as_deref(), false, 1, read_stdin)?;
            let data = data.into_iter().next().unwrap_or_default();
            let mut backend = backends::connect_queue(&config).await?;
            let result = request(backend.as_mut(), &args, data, verbose, &mut output).await;
            finish(result, backend.close().await)
        }
        Commands::Publish(args) => {
            let data = payloads(args.message.as_deref(), args.lines, args.count, read_stdin)?;
            let mut backend = backends::connect_topic(&config).await?;
            let result = publish(backend.as_mut(), &args, data).await.map(|_| ());
            finish(result, backend.close().await)
        }
        Commands::Subscribe(args) => {
            let mut backend = backends::connect_topic(&config).await?;
            let result = subscribe(backend.as_mut(), &args, verbose, &mut output)
                .await
                .map(|_| ());
            finish(result, backend.close().await)
        }
        Commands::Manage(command) => {
            let mut manager = backends::connect_manager(&config).await?;
            let result = manage(manager.as_mut(), &command, &mut output).await;
            finish(result, manager.close().await)
        }
    }
}

// ============================================================================
// Queue verbs
// ============================================================================

/// Send every payload with the same headers.
pub async fn send(
    backend: &mut dyn QueueBackend,
    args: &SendArgs,
    data: Vec<Vec<u8>>,
) -> Result<usize> {
    let total = data.len();
    for (i, payload) in data.into_iter().enumerate() {
        let opts = SendOptions {
            queue: args.queue.clone(),
            message: args.headers.message(payload, args.reply_to.as_deref()),
        };
        backend
            .send(&opts)
            .await
            .with_context(|| format!("sending to '{}'", args.queue))?;
        if total > 1 {
            debug!(sent = i + 1, total, "Sent message");
        }
    }
    info!(queue = %args.queue, count = total, "Sent");
    Ok(total)
}

/// Receive or peek up to `count` messages, printing each. Returns how many.
pub async fn receive(
    backend: &mut dyn QueueBackend,
    args: &ReceiveArgs,
    acknowledge: bool,
    verbose: bool,
    output: &mut Output<'_>,
) -> Result<u32> {
    let base = if acknowledge {
        ReceiveOptions::get(&args.queue)
    } else {
        ReceiveOptions::peek(&args.queue)
    };
    let mut opts = base
        .with_timeout(seconds(args.timeout)?)
        .with_metadata(verbose || !acknowledge)
        .with_properties(!args.quiet || verbose);
    if args.wait {
        opts = opts.wait_forever();
    }
    if let Some(selector) = &args.selector {
        opts = opts.with_selector(selector);
    }

    if !acknowledge {
        if let Some(caveat) = backend.capabilities().peek.caveat() {
            warn!("{}", caveat);
        }
    }

    let render = Render {
        json: args.json,
        quiet: args.quiet,
        verbose: verbose || !acknowledge,
    };
    let mut received = 0;
    while received < args.count {
        let Some(outcome) = interruptible(backend.receive(&opts)).await else {
            break;
        };
        match outcome {
            Ok(message) => {
                render.message(&message, output.out, output.err)?;
                received += 1;
            }
            Err(e) if e.is_no_message() => {
                debug!(queue = %args.queue, received, "No more messages");
                break;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("receiving from '{}'", args.queue));
            }
        }
    }
    Ok(received)
}

/// Send one request and print its reply.
pub async fn request(
    backend: &mut dyn QueueBackend,
    args: &RequestArgs,
    data: Vec<u8>,
    verbose: bool,
    output: &mut Output<'_>,
) -> Result<()> {
    let send = SendOptions {
        queue: args.queue.clone(),
        message: args.headers.message(data, args.reply_to.as_deref()),
    };
    let opts = RequestOptions::new(send)
        .with_timeout(seconds(args.timeout)?)
        .with_metadata(verbose)
        .with_properties(!args.quiet || verbose);
    let mut request = Request::new(opts);
    info!(reply_to = %request.reply_to(), "Waiting for reply");

    let Some(outcome) = interruptible(request.run(backend)).await else {
        return Ok(());
    };
    let reply = outcome.with_context(|| format!("request to '{}'", args.queue))?;

    let render = Render {
        json: args.json,
        quiet: args.quiet,
        verbose,
    };
    render.message(&reply, output.out, output.err)?;
    Ok(())
}

// ============================================================================
// Topic verbs
// ============================================================================

pub async fn publish(
    backend: &mut dyn TopicBackend,
    args: &PublishArgs,
    data: Vec<Vec<u8>>,
) -> Result<usize> {
    let total = data.len();
    for payload in data {
        let opts = PublishOptions {
            topic: args.topic.clone(),
            key: args.key.clone().filter(|k| !k.is_empty()),
            message: args.headers.message(payload, args.reply_to.as_deref()),
        };
        backend
            .publish(&opts)
            .await
            .with_context(|| format!("publishing to '{}'", args.topic))?;
    }
    info!(topic = %args.topic, count = total, "Published");
    Ok(total)
}

/// Print up to `count` messages from the subscription. Returns how many.
pub async fn subscribe(
    backend: &mut dyn TopicBackend,
    args: &SubscribeArgs,
    verbose: bool,
    output: &mut Output<'_>,
) -> Result<u32> {
    let mut opts = SubscribeOptions::new(&args.topic)
        .durable(args.durable)
        .with_timeout(seconds(args.timeout)?)
        .with_metadata(verbose)
        .with_properties(!args.quiet || verbose);
    if let Some(group) = &args.group {
        opts = opts.with_group(group);
    }
    if let Some(selector) = &args.selector {
        opts = opts.with_selector(selector);
    }
    if args.wait {
        opts = opts.wait_forever();
    }

    let render = Render {
        json: args.json,
        quiet: args.quiet,
        verbose,
    };
    let mut received = 0;
    while received < args.count {
        let Some(outcome) = interruptible(backend.subscribe(&opts)).await else {
            break;
        };
        match outcome {
            Ok(message) => {
                render.message(&message, output.out, output.err)?;
                received += 1;
            }
            Err(e) if e.is_no_message() => break,
            Err(e) => {
                return Err(e).with_context(|| format!("subscribing to '{}'", args.topic));
            }
        }
    }
    Ok(received)
}

// ============================================================================
// Management
// ============================================================================

pub async fn manage(
    manager: &mut dyn Manageable,
    command: &ManageCommand,
    output: &mut Output<'_>,
) -> Result<()> {
    match command {
        ManageCommand::List { json } => {
            let rows = manager.list_destinations().await.context("listing destinations")?;
            if *json {
                serde_json::to_writer_pretty(&mut *output.out, &rows)?;
                writeln!(output.out)?;
            } else {
                write!(output.out, "{}", destination_table(&rows))?;
            }
        }
        ManageCommand::Purge { queue } => {
            let removed = manager
                .purge(queue)
                .await
                .with_context(|| format!("purging '{}'", queue))?;
            match removed {
                Some(n) => writeln!(output.err, "Purged {} message(s) from {}", n, queue)?,
                None => writeln!(output.err, "Purged {}", queue)?,
            }
        }
        ManageCommand::Stats { queue, json } => {
            let stats = manager
                .stats(queue)
                .await
                .with_context(|| format!("reading stats for '{}'", queue))?;
            if *json {
                serde_json::to_writer_pretty(&mut *output.out, &stats)?;
                writeln!(output.out)?;
            } else {
                write!(output.out, "{}", stats_lines(&stats))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
