use std::process::ExitCode;

use danir::{
    logging::{self, LogFormat},
    wire::{
        checksum::{NEXT_HEADER_ICMPV6, NEXT_HEADER_UDP},
        dhcpv6::Message,
        frame::{self, FrameError},
        ra::RouterAdvertisement,
        DecodeError,
    },
};
use thiserror::Error;
use tracing::{debug, error, warn};

const HELP: &str = "\
danir-decode: print a DHCPv6 message or Router Advertisement

USAGE:
  danir-decode [OPTIONS] <HEX>

  HEX is a DHCPv6 payload, or a full Ethernet frame with --frame.
  Whitespace and colons are ignored.

OPTIONS:
  --frame       input is an Ethernet/IPv6 frame (UDP or ICMPv6)
  --json        log as JSON
  -v            more logging, repeat for trace
  -h, --help    print this help
";

struct Args {
    frame: bool,
    json: bool,
    verbosity: usize,
    hex: String,
}

fn parse_args() -> Result<Option<Args>, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        return Ok(None);
    }
    let frame = pargs.contains("--frame");
    let json = pargs.contains("--json");
    let mut verbosity = 0;
    while pargs.contains("-v") {
        verbosity += 1;
    }
    let hex = pargs.free_from_str()?;
    let rest = pargs.finish();
    if !rest.is_empty() {
        eprintln!("ignoring extra arguments: {rest:?}");
    }
    Ok(Some(Args {
        frame,
        json,
        verbosity,
        hex,
    }))
}

#[derive(Debug, Error)]
enum Failure {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("next header {0} carries neither DHCPv6 nor ICMPv6")]
    Unsupported(u8),
}

#[derive(Debug)]
enum Decoded {
    Dhcpv6(Message),
    RouterAdvertisement(RouterAdvertisement),
}

fn decode(input: &str, is_frame: bool) -> Result<Decoded, Failure> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let bytes = hex::decode(cleaned)?;
    debug!(len = bytes.len(), "decoded hex");
    if !is_frame {
        return Ok(Decoded::Dhcpv6(Message::decode(&bytes)?));
    }

    let packet = frame::parse_ipv6(&bytes)?;
    debug!(src = %packet.src, dst = %packet.dst, next_header = packet.next_header, "ipv6");
    match packet.next_header {
        NEXT_HEADER_UDP => {
            let dgram = frame::parse_udp(&bytes)?;
            if dgram.src_port != danir::SERVER_PORT && dgram.dst_port != danir::SERVER_PORT {
                warn!(
                    src_port = dgram.src_port,
                    dst_port = dgram.dst_port,
                    "not DHCPv6 ports, decoding anyway"
                );
            }
            Ok(Decoded::Dhcpv6(Message::decode(dgram.payload)?))
        }
        NEXT_HEADER_ICMPV6 => {
            let packet = frame::parse_icmpv6(&bytes)?;
            Ok(Decoded::RouterAdvertisement(RouterAdvertisement::decode(
                packet.payload,
            )?))
        }
        other => Err(Failure::Unsupported(other)),
    }
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            print!("{HELP}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}\n\n{HELP}");
            return ExitCode::from(2);
        }
    };
    let format = if args.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    logging::init(logging::level_from_verbosity(args.verbosity), format);

    match decode(&args.hex, args.frame) {
        Ok(decoded) => {
            println!("{decoded:#?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%e, "decode failed");
            ExitCode::FAILURE
        }
    }
}
