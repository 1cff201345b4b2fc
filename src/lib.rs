#[macro_use]
mod ioerr;
pub mod stream;
pub mod io;
pub mod data_reader;
pub mod types;
pub mod track;
pub mod mp4_dash_reader;
pub mod mp4_from_dash_writer;
pub mod webm_reader;
pub mod webm_writer;
pub mod ogg_from_webm_writer;
pub mod srt_from_ttml_writer;
pub mod postprocessing;
