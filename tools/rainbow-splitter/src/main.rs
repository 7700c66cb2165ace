//! Line-oriented demultiplexer for multi-language packets.
//!
//! Each stdin line begins with a two-token wall-clock timestamp,
//! followed by a tab-separated sequence of `(language, sentence)`
//! pairs; the first field still carries the timestamp prefix.
//! Every configured language gets a persistent connection and
//! receives `"{timestamp} {sentence}\n"`.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Splits a multi-language packet stream onto per-language ports.
#[derive(Parser, Debug)]
#[command(name = "rainbow-splitter")]
struct Args {
    /// Language tags followed by an equal number of ports, e.g.
    /// `cs de 9120 9121`.
    #[arg(required = true)]
    spec: Vec<String>,
}

fn split_spec(spec: &[String]) -> anyhow::Result<(Vec<String>, Vec<u16>)> {
    if spec.len() % 2 != 0 {
        bail!("expected an equal number of language tags and ports");
    }
    let half = spec.len() / 2;
    let langs = spec[..half].to_vec();
    let ports = spec[half..]
        .iter()
        .map(|p| {
            p.parse::<u16>()
                .with_context(|| format!("invalid port `{p}`"))
        })
        .collect::<anyhow::Result<Vec<u16>>>()?;
    Ok((langs, ports))
}

#[derive(Debug)]
struct Packet<'a> {
    timestamp: &'a str,
    pairs: Vec<(&'a str, &'a str)>,
}

fn parse_packet<'a>(line: &'a str, expected: &[String]) -> anyhow::Result<Packet<'a>> {
    let timestamp_end = line
        .match_indices(' ')
        .nth(1)
        .map(|(i, _)| i)
        .with_context(|| format!("no timestamp in line `{line}`"))?;
    let timestamp = &line[..timestamp_end];

    let mut fields: Vec<&str> = line.split('\t').collect();
    // The first field still carries the timestamp prefix.
    if fields[0].len() < timestamp_end + 1 {
        bail!("no payload after the timestamp in line `{line}`");
    }
    fields[0] = &fields[0][timestamp_end + 1..];

    let pairs: Vec<(&str, &str)> = fields
        .chunks_exact(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();

    let seen: BTreeSet<&str> = pairs.iter().map(|(lang, _)| *lang).collect();
    let wanted: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    if seen != wanted {
        bail!(
            "packet languages [{}] do not match the configured set [{}]",
            seen.into_iter().collect::<Vec<_>>().join(" "),
            expected.join(" ")
        );
    }

    Ok(Packet { timestamp, pairs })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let (langs, ports) = split_spec(&args.spec)?;

    let mut outputs: HashMap<String, TcpStream> = HashMap::new();
    for (lang, port) in langs.iter().zip(&ports) {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, *port))
            .await
            .with_context(|| format!("connecting output for language {lang}"))?;
        stream.set_nodelay(true)?;
        outputs.insert(lang.clone(), stream);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let packet = parse_packet(&line, &langs)?;
        for (lang, sentence) in &packet.pairs {
            let Some(sink) = outputs.get_mut(*lang) else {
                continue;
            };
            let message = format!("{} {}\n", packet.timestamp, sentence);
            if let Err(e) = sink.write_all(message.as_bytes()).await {
                // A broken consumer costs one language, not the
                // whole splitter.
                log::warn!("send to {lang} failed: {e}");
            }
        }
    }
    Ok(())
}
