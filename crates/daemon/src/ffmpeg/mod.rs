//! ffmpeg integration: progress parsing, split jobs and capability queries

pub mod inspect;
pub mod progress;
pub mod split;

pub use inspect::{
    AudioCodec, EncoderInfo, EncoderKind, TranscoderInfo, TranscoderInspector, VideoCodec,
};
pub use progress::{ProgressEvent, ProgressParser};
pub use split::{
    build_split_command, SplitError, SplitJob, SplitJobResult, SplitJobSpec, SplitOptions,
};
