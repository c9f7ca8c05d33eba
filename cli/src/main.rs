mod wav;

use ac4qgp_core::config::{ALLOWED_FREQUENCY_CHANNELS, DEFAULT_FREQUENCY_CHANNEL};
use ac4qgp_core::filter::BandPass;
use ac4qgp_core::link::TxState;
use ac4qgp_core::telegram::modulate;
use ac4qgp_core::{
    derive_settings, Command, Config, LinkError, LinkShared, LinkStats, Loopback, PeerInfo,
    Receiver, Session, Telegram, ToneCodec, FREQUENCY_CHANNELS,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "ac4qgp")]
#[command(about = "Audio modem link for encrypted chat over a voice channel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modulate one telegram into a WAV file
    Encode {
        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        /// Telegram command
        #[arg(short, long, value_enum, default_value = "chat-data")]
        command: CommandArg,

        /// Payload, sent as raw UTF-8 bytes
        #[arg(short, long, default_value = "")]
        text: String,

        #[arg(long, default_value_t = 1)]
        seq_nr: u8,

        #[arg(long, default_value_t = 0)]
        seq_nr_ack: u8,

        /// Set the ACK flag
        #[arg(long)]
        ack: bool,

        /// Silence before the telegram, in milliseconds
        #[arg(long, default_value_t = 100)]
        lead_ms: u64,

        #[command(flatten)]
        link: LinkArgs,
    },

    /// Decode every telegram found in a WAV file
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Sequence number treated as already acknowledged
        #[arg(long, default_value_t = 0)]
        last_acked: u8,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        link: LinkArgs,
    },

    /// List the frequency channels
    Channels {
        #[arg(long)]
        json: bool,
    },

    /// Connect two sessions over an in-process audio loopback and chat
    Chat {
        #[arg(long, default_value = "alice")]
        caller: String,

        #[arg(long, default_value = "bob")]
        callee: String,

        /// Message sent by the caller (repeatable)
        #[arg(short, long, default_value = "hello")]
        message: Vec<String>,

        /// Loopback speed relative to real time
        #[arg(long, default_value_t = 1.0)]
        speed: f64,

        #[arg(long)]
        json: bool,

        #[command(flatten)]
        link: LinkArgs,
    },
}

#[derive(Args)]
struct LinkArgs {
    /// Frequency channel index
    #[arg(long, default_value_t = DEFAULT_FREQUENCY_CHANNEL)]
    channel: usize,

    #[arg(long, default_value_t = 48_000)]
    sample_rate: u32,

    #[arg(long, default_value_t = 3)]
    max_resends: u32,

    /// Band-pass the coding tones when encoding and before decoding
    #[arg(long)]
    band_pass: bool,
}

impl LinkArgs {
    fn config(&self) -> Config {
        Config {
            frequency_channel: self.channel,
            sample_rate: self.sample_rate,
            max_resends: self.max_resends,
            tx_band_pass: self.band_pass,
            rx_band_pass: self.band_pass,
            ..Config::default()
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CommandArg {
    None,
    Call,
    CallAccepted,
    CallRejected,
    CallEnd,
    KeyStart,
    KeyEnd,
    StartupData,
    StartupDataComplete,
    ChatDataStart,
    ChatDataPart,
    ChatDataEnd,
    ChatData,
}

impl From<CommandArg> for Command {
    fn from(arg: CommandArg) -> Self {
        match arg {
            CommandArg::None => Command::None,
            CommandArg::Call => Command::Call,
            CommandArg::CallAccepted => Command::CallAccepted,
            CommandArg::CallRejected => Command::CallRejected,
            CommandArg::CallEnd => Command::CallEnd,
            CommandArg::KeyStart => Command::KeyStart,
            CommandArg::KeyEnd => Command::KeyEnd,
            CommandArg::StartupData => Command::StartupData,
            CommandArg::StartupDataComplete => Command::StartupDataComplete,
            CommandArg::ChatDataStart => Command::ChatDataStart,
            CommandArg::ChatDataPart => Command::ChatDataPart,
            CommandArg::ChatDataEnd => Command::ChatDataEnd,
            CommandArg::ChatData => Command::ChatData,
        }
    }
}

#[derive(Serialize)]
struct DecodedTelegram {
    command: &'static str,
    seq_nr: u8,
    seq_nr_ack: u8,
    ack: bool,
    repeated: bool,
    data: String,
    text: String,
}

#[derive(Serialize)]
struct ChannelRow {
    index: usize,
    one_hz: u32,
    zero_hz: u32,
    allowed: bool,
}

#[derive(Serialize)]
struct PartyReport {
    name: String,
    partner: String,
    session_code: u32,
    tx_ok: u64,
    tx_nok: u64,
    rx_ok: u64,
    rx_nok: u64,
    roundtrip_ms: Option<u128>,
}

impl PartyReport {
    fn new(name: &str, peer: &PeerInfo, stats: LinkStats) -> Self {
        Self {
            name: name.to_string(),
            partner: peer.partner_name.clone(),
            session_code: peer.session_code,
            tx_ok: stats.tx_ok,
            tx_nok: stats.tx_nok,
            rx_ok: stats.rx_ok,
            rx_nok: stats.rx_nok,
            roundtrip_ms: stats.roundtrip.map(|d| d.as_millis()),
        }
    }
}

#[derive(Serialize)]
struct ChatReport {
    caller: PartyReport,
    callee: PartyReport,
    delivered: Vec<String>,
    reply: Option<String>,
    call_ended: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            output,
            command,
            text,
            seq_nr,
            seq_nr_ack,
            ack,
            lead_ms,
            link,
        } => {
            let telegram = Telegram {
                seq_nr,
                seq_nr_ack,
                command: command.into(),
                ack,
                data: text.into_bytes(),
            };
            encode_command(&output, &telegram, lead_ms, &link.config())?
        }
        Commands::Decode {
            input,
            last_acked,
            json,
            link,
        } => decode_command(&input, last_acked, json, &link.config())?,
        Commands::Channels { json } => channels_command(json)?,
        Commands::Chat {
            caller,
            callee,
            message,
            speed,
            json,
            link,
        } => chat_command(&caller, &callee, &message, speed, json, link.config())?,
    }

    Ok(())
}

fn encode_command(
    output_path: &PathBuf,
    telegram: &Telegram,
    lead_ms: u64,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    let settings = derive_settings(config)?;
    if telegram.data.len() > settings.data_max_len_bytes {
        return Err(LinkError::DataLengthExceeded {
            len: telegram.data.len(),
            max: settings.data_max_len_bytes,
        }
        .into());
    }

    let codec = ToneCodec::new(&settings);
    let wire = telegram.to_wire(config.preamble_len_bytes, config.terminator_len_bytes);
    let lead = (config.sample_rate as u64 * lead_ms / 1000) as usize;
    let mut tones = modulate(&codec, &wire, settings.chunk_len);
    if config.tx_band_pass {
        BandPass::coding(&settings)?.process(&mut tones);
    }
    let mut samples = vec![0.0; lead];
    samples.extend(tones);
    println!("Encoded {} ({} bytes on the wire) to {} samples", telegram, wire.len(), samples.len());

    wav::write_wav(output_path, &samples, config.sample_rate)?;
    println!("Wrote {}", output_path.display());
    Ok(())
}

fn decode_command(
    input_path: &PathBuf,
    last_acked: u8,
    json: bool,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    let settings = derive_settings(config)?;
    let mut samples = wav::read_wav(input_path, config.sample_rate)?;
    log::info!("extracted {} samples", samples.len());
    // flush the final partial chunk through the pipeline
    samples.resize(samples.len() + settings.chunk_len, 0.0);

    let shared = Arc::new(LinkShared::new(settings));
    shared.seq_nr_ack.store(last_acked, std::sync::atomic::Ordering::SeqCst);
    let mut receiver = Receiver::new(Arc::clone(&shared)).with_log();
    receiver.push_samples(&samples)?;

    let decoded: Vec<DecodedTelegram> = receiver
        .take_log()
        .into_iter()
        .map(|r| DecodedTelegram {
            command: r.telegram.command.name(),
            seq_nr: r.telegram.seq_nr,
            seq_nr_ack: r.telegram.seq_nr_ack,
            ack: r.telegram.ack,
            repeated: r.repeated,
            data: r.telegram.data.iter().map(|b| format!("{:02x}", b)).collect(),
            text: String::from_utf8_lossy(&r.telegram.data).into_owned(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&decoded)?);
    } else {
        for t in &decoded {
            println!(
                "{}{} sn={} sna={}{} data=\"{}\"",
                t.command,
                if t.ack { "+ACK" } else { "" },
                t.seq_nr,
                t.seq_nr_ack,
                if t.repeated { " (repeated)" } else { "" },
                t.text
            );
        }
        let stats = shared.stats();
        println!(
            "Decoded {} telegrams ({} receive errors)",
            decoded.len(),
            stats.rx_nok
        );
    }
    Ok(())
}

fn channels_command(json: bool) -> Result<(), Box<dyn Error>> {
    let rows: Vec<ChannelRow> = FREQUENCY_CHANNELS
        .iter()
        .enumerate()
        .map(|(index, ch)| ChannelRow {
            index,
            one_hz: ch.one_hz,
            zero_hz: ch.zero_hz,
            allowed: ALLOWED_FREQUENCY_CHANNELS.contains(&index),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    println!("{:>5} {:>8} {:>8}", "index", "ONE Hz", "ZERO Hz");
    for row in &rows {
        println!(
            "{:>5} {:>8} {:>8}{}",
            row.index,
            row.one_hz,
            row.zero_hz,
            if row.allowed { "" } else { "  (not allowed)" }
        );
    }
    Ok(())
}

fn chat_command(
    caller_name: &str,
    callee_name: &str,
    messages: &[String],
    speed: f64,
    json: bool,
    config: Config,
) -> Result<(), Box<dyn Error>> {
    if speed.is_nan() || speed <= 0.0 {
        return Err(format!("speed must be positive, got {}", speed).into());
    }
    let (caller, caller_port) = Session::start(config.clone())?;
    let (callee, callee_port) = Session::start(config)?;
    let pace = caller_port.chunk_duration().div_f64(speed);
    let mut loopback = Loopback::start(caller_port, callee_port, pace)?;

    let (dialed, answered) = thread::scope(|s| {
        let answering = s.spawn(|| {
            if !callee.wait_for_call(Duration::from_secs(60))? {
                return Err(LinkError::HandshakeTimeout("incoming call"));
            }
            callee.answer(callee_name)
        });
        let dialed = caller.dial(caller_name);
        let answered = answering
            .join()
            .unwrap_or(Err(LinkError::HandshakeTimeout("answer")));
        (dialed, answered)
    });
    let caller_peer = dialed?;
    let callee_peer = answered?;
    if !json {
        println!(
            "{} <-> {} connected, session codes {} / {}",
            callee_peer.partner_name, caller_peer.partner_name, caller_peer.session_code, callee_peer.session_code
        );
    }

    let timeout = Duration::from_secs(120);
    let mut delivered = Vec::new();
    for message in messages {
        caller.send_message(message)?;
        let received = callee
            .recv_message(timeout)
            .ok_or_else(|| format!("message {:?} was not delivered", message))?;
        if !json {
            println!("{} -> {}: {}", caller_name, callee_name, received);
        }
        delivered.push(received);
    }

    let reply_text = format!("got {} message(s)", delivered.len());
    callee.send_message(&reply_text)?;
    let reply = caller.recv_message(timeout);
    if let (Some(reply), false) = (&reply, json) {
        println!("{} -> {}: {}", callee_name, caller_name, reply);
    }

    caller.end_call();
    let deadline = Instant::now() + timeout;
    let mut call_ended = false;
    while Instant::now() < deadline {
        if callee.is_call_end() {
            call_ended = true;
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    // CALL_END is sequenced; wait for its ACK before reading the counters
    while caller.tx_state() != TxState::Idle && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    loopback.stop();

    let report = ChatReport {
        caller: PartyReport::new(caller_name, &caller_peer, caller.stats()),
        callee: PartyReport::new(callee_name, &callee_peer, callee.stats()),
        delivered,
        reply,
        call_ended,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for party in [&report.caller, &report.callee] {
            println!(
                "{}: tx {} ok / {} nok, rx {} ok / {} nok, last roundtrip {}",
                party.name,
                party.tx_ok,
                party.tx_nok,
                party.rx_ok,
                party.rx_nok,
                party
                    .roundtrip_ms
                    .map_or_else(|| "-".to_string(), |ms| format!("{} ms", ms))
            );
        }
        println!("call ended: {}", report.call_ended);
    }
    Ok(())
}
