use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse backend payload on `{stage}`, {source}"))]
    ParsePayload {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("a stream is already active for conversation '{conversation_id}'"))]
    StreamAlreadyActive {
        stage: &'static str,
        conversation_id: String,
    },
}

pub type ClientResult<T> = Result<T, ClientError>;
