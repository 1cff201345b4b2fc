use anyhow::{anyhow, Context, Result};
use clap;
use structopt::StructOpt;

use dashmux::io::MmapStream;
use dashmux::mp4_dash_reader::Mp4DashReader;
use dashmux::mp4_from_dash_writer::Mp4FromDashWriter;
use dashmux::ogg_from_webm_writer::OggFromWebMWriter;
use dashmux::postprocessing;
use dashmux::srt_from_ttml_writer::SrtFromTtmlWriter;
use dashmux::stream::{FileStream, MediaStream};
use dashmux::track::TrackInfo;
use dashmux::types::BRAND_M4A;
use dashmux::webm_reader::WebMReader;
use dashmux::webm_writer::WebMWriter;

#[derive(StructOpt, Debug)]
#[structopt(setting = clap::AppSettings::VersionlessSubcommands)]
pub struct MainOpts {
    #[structopt(long)]
    /// Log options (like RUSTLOG; trace, debug, info etc)
    pub log: Option<String>,
    #[structopt(subcommand)]
    pub cmd: Command,
}

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case")]
pub enum Command {
    #[structopt(display_order = 1)]
    /// Track information.
    Info(InfoOpts),

    #[structopt(display_order = 2)]
    /// Mux DASH mp4 fragments into one mp4 file.
    MuxMp4(MuxMp4Opts),

    #[structopt(display_order = 3)]
    /// Mux webm files into one webm file.
    MuxWebm(MuxWebmOpts),

    #[structopt(display_order = 4)]
    /// Extract an audio track from webm into ogg.
    Ogg(OggOpts),

    #[structopt(display_order = 5)]
    /// Convert TTML subtitles to SRT.
    Srt(SrtOpts),

    #[structopt(display_order = 6)]
    /// Run a post-processing algorithm.
    Run(RunOpts),
}

#[derive(StructOpt, Debug)]
pub struct InfoOpts {
    #[structopt(short, long)]
    /// Output in JSON
    pub json: bool,

    /// Input filename.
    pub input: String,
}

#[derive(StructOpt, Debug)]
pub struct MuxMp4Opts {
    #[structopt(long)]
    /// Write an audio-only m4a file.
    pub m4a: bool,

    /// Output filename.
    pub output: String,
    /// Input filenames, one track each.
    #[structopt(required = true)]
    pub inputs: Vec<String>,
}

#[derive(StructOpt, Debug)]
pub struct MuxWebmOpts {
    /// Output filename.
    pub output: String,
    /// Input filenames, one track each.
    #[structopt(required = true)]
    pub inputs: Vec<String>,
}

#[derive(StructOpt, Debug)]
pub struct OggOpts {
    #[structopt(short, long, default_value = "0")]
    /// Select track (index).
    pub track: usize,

    /// Input filename.
    pub input: String,
    /// Output filename.
    pub output: String,
}

#[derive(StructOpt, Debug)]
pub struct SrtOpts {
    #[structopt(long)]
    /// Keep frames without text.
    pub keep_empty: bool,

    /// Input filename.
    pub input: String,
    /// Output filename.
    pub output: String,
}

#[derive(StructOpt, Debug)]
pub struct RunOpts {
    #[structopt(short, long = "arg", number_of_values = 1)]
    /// Algorithm argument (may be repeated).
    pub args: Vec<String>,

    /// Algorithm (ttml, webm, mp4D-mp4, mp4D-m4a, webm-ogg-d)
    pub algorithm: String,
    /// Output filename.
    pub output: String,
    /// Input filenames.
    #[structopt(required = true)]
    pub inputs: Vec<String>,
}

fn main() -> Result<()> {
    let opts = MainOpts::from_args();

    let mut builder = env_logger::Builder::new();
    if let Some(ref log_opts) = opts.log {
        builder.parse_filters(log_opts);
    } else if let Ok(ref log_opts) = std::env::var("RUST_LOG") {
        builder.parse_filters(log_opts);
    } else {
        builder.parse_filters("info");
    }
    builder.init();

    match opts.cmd {
        Command::Info(opts) => return info(opts),
        Command::MuxMp4(opts) => return mux_mp4(opts),
        Command::MuxWebm(opts) => return mux_webm(opts),
        Command::Ogg(opts) => return ogg(opts),
        Command::Srt(opts) => return srt(opts),
        Command::Run(opts) => return run(opts),
    }
}

fn open(name: &str) -> Result<MmapStream> {
    MmapStream::open(name).with_context(|| name.to_string())
}

fn create(name: &str) -> Result<FileStream> {
    FileStream::create(name).with_context(|| name.to_string())
}

fn open_all(names: &[String]) -> Result<Vec<MmapStream>> {
    names.iter().map(|n| open(n)).collect()
}

fn info(opts: InfoOpts) -> Result<()> {
    let mut input = open(&opts.input)?;
    let is_webm = input.remaining().starts_with(&[0x1A, 0x45, 0xDF, 0xA3]);

    let tracks: Vec<TrackInfo> = if is_webm {
        let mut reader = WebMReader::new(&mut input);
        reader.parse()?;
        let seg = reader.info();
        reader.tracks().iter().enumerate().map(|(i, t)| TrackInfo::from_webm(i, t, seg)).collect()
    } else {
        let mut reader = Mp4DashReader::new(&mut input);
        reader.parse()?;
        log::debug!("brands: {:?}", reader.brands()?);
        reader.tracks().iter().enumerate().map(|(i, t)| TrackInfo::from_mp4(i, t)).collect()
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&tracks)?);
    } else {
        for t in &tracks {
            println!("{}", t.short());
        }
    }
    Ok(())
}

fn mux_mp4(opts: MuxMp4Opts) -> Result<()> {
    let count = opts.inputs.len();
    let mut muxer = Mp4FromDashWriter::new(open_all(&opts.inputs)?)?;
    if opts.m4a {
        muxer.set_main_brand(BRAND_M4A);
    }
    muxer.parse_sources()?;
    muxer.select_tracks(&vec![0; count])?;
    muxer.build(create(&opts.output)?)?;
    muxer.close()?;
    Ok(())
}

fn mux_webm(opts: MuxWebmOpts) -> Result<()> {
    let count = opts.inputs.len();
    let mut muxer = WebMWriter::new(open_all(&opts.inputs)?);
    muxer.parse_sources()?;
    muxer.select_tracks(&vec![0; count])?;
    muxer.build(create(&opts.output)?)?;
    muxer.close()?;
    Ok(())
}

fn ogg(opts: OggOpts) -> Result<()> {
    let mut demuxer = OggFromWebMWriter::new(open(&opts.input)?, create(&opts.output)?)?;
    demuxer.parse_source()?;
    demuxer.select_track(opts.track)?;
    demuxer.build()?;
    demuxer.close()?;
    Ok(())
}

fn srt(opts: SrtOpts) -> Result<()> {
    let mut writer = SrtFromTtmlWriter::new(create(&opts.output)?, !opts.keep_empty);
    writer.build(open(&opts.input)?)?;
    writer.close()?;
    Ok(())
}

fn run(opts: RunOpts) -> Result<()> {
    let mut alg = postprocessing::algorithm(&opts.algorithm, &opts.args)?;

    let mut sources = Vec::new();
    for name in &opts.inputs {
        sources.push(Box::new(open(name)?) as Box<dyn MediaStream>);
    }
    if !alg.test(&mut sources)? {
        return Err(anyhow!("{}: algorithm does not apply to these inputs", alg.name()));
    }

    let mut out = create(&opts.output)?;
    alg.process(&mut out, &mut sources)?;
    out.close()?;
    Ok(())
}
