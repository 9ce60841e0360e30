use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::form_urlencoded;

use tailcast_types::{StreamKind, StreamSelector};

/// Why a subscription was refused
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    MissingParameters,
    InvalidStreamKind,
    ProcessNotFound,
    ResolveFailed,
    WatchFailed,
}

impl Rejection {
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::MissingParameters | Self::InvalidStreamKind | Self::ProcessNotFound => {
                CloseCode::Policy
            }
            Self::ResolveFailed | Self::WatchFailed => CloseCode::Error,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingParameters => "missing required parameters: appName and logType",
            Self::InvalidStreamKind => "logType must be stdout or stderr",
            Self::ProcessNotFound => "process not found",
            Self::ResolveFailed => "failed to resolve process",
            Self::WatchFailed => "failed to watch log file",
        }
    }
}

/// Extract `appName` and `logType` from a request query string
pub fn parse_selector(query: Option<&str>) -> Result<StreamSelector, Rejection> {
    let mut process = None;
    let mut kind = None;

    for (key, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "appName" if process.is_none() => process = Some(value.into_owned()),
            "logType" if kind.is_none() => kind = Some(value.into_owned()),
            _ => {}
        }
    }

    let (Some(process), Some(kind)) = (
        process.filter(|p| !p.is_empty()),
        kind.filter(|k| !k.is_empty()),
    ) else {
        return Err(Rejection::MissingParameters);
    };
    let kind: StreamKind = kind.parse().map_err(|_| Rejection::InvalidStreamKind)?;

    Ok(StreamSelector::new(process, kind))
}
