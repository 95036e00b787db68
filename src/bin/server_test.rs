// ABOUTME: Diagnostic CLI that sends one synthetic frame to a remote encode server and times the round trip
// ABOUTME: Grounded on the original's tools/server_test.cc smoke-test utility

use argh::FromArgs;
use dcp_encode_engine::config::{ENCODE_FRAME_PORT, SERVER_LINK_VERSION};
use dcp_encode_engine::frame::{write_encoding_request, ColourRangeXml, EncodingRequestXml, EyeXml, PixelFormatXml};
use dcp_encode_engine::socket::{Socket, MAX_PAYLOAD_SIZE};
use std::process::ExitCode;

#[derive(FromArgs)]
/// Send one synthetic test frame to a remote encode server and report timing.
struct Args {
    /// host to connect to
    #[argh(positional)]
    host: String,

    /// frame width in pixels
    #[argh(option, default = "1998")]
    width: u32,

    /// frame height in pixels
    #[argh(option, default = "1080")]
    height: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Args = argh::from_env();

    let result = run(&args).await;
    match result {
        Ok(elapsed) => {
            println!(
                "server {} encoded a {}x{} test frame in {}ms",
                args.host,
                args.width,
                args.height,
                elapsed.as_millis()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("server test failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<std::time::Duration, Box<dyn std::error::Error>> {
    let mut socket = Socket::connect((args.host.as_str(), ENCODE_FRAME_PORT)).await?;

    let request = EncodingRequestXml {
        frame_index: 0,
        eye: EyeXml::Both,
        width: args.width,
        height: args.height,
        pixel_format: PixelFormatXml::Rgb24,
        colour_range: ColourRangeXml::Full,
        server_link_version: SERVER_LINK_VERSION,
    };

    let pixel_count = args.width as usize * args.height as usize * 3;
    let pixels = vec![0u8; pixel_count];

    let started = std::time::Instant::now();
    write_encoding_request(&mut socket, &request).await?;
    socket.write_all(&pixels).await?;
    let _response = socket.read_framed(MAX_PAYLOAD_SIZE).await?;

    Ok(started.elapsed())
}
