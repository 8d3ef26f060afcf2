use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TranscriptError {
    #[snafu(display("conversation '{id}' was not found"))]
    ConversationNotFound { stage: &'static str, id: String },
    #[snafu(display("transcript id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

pub type TranscriptResult<T> = Result<T, TranscriptError>;
