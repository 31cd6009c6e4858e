use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelMap;
use crate::ids::RequestId;

/// How `start`/`duration` of a request are interpreted by the data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    Absolute,
    Newest,
    Oldest,
    Next,
    Registration,
}

impl ReferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absolute => "absolute",
            Self::Newest => "newest",
            Self::Oldest => "oldest",
            Self::Next => "next",
            Self::Registration => "registration",
        }
    }
}

impl fmt::Display for ReferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "absolute" => Ok(Self::Absolute),
            "newest" => Ok(Self::Newest),
            "oldest" => Ok(Self::Oldest),
            "next" => Ok(Self::Next),
            "registration" => Ok(Self::Registration),
            other => Err(format!("unknown reference mode: {other}")),
        }
    }
}

/// Lifetime class of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Answered by a single batch.
    OneShot,
    /// Long-lived pull stream.
    Subscribe,
    /// Long-lived push stream with relaxed delivery.
    Monitor,
}

impl RequestKind {
    pub fn is_streaming(&self) -> bool {
        !matches!(self, Self::OneShot)
    }
}

/// Time window of a request.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestWindow {
    pub start: f64,
    pub duration: f64,
    pub reference: ReferenceMode,
}

impl RequestWindow {
    pub fn new(start: f64, duration: f64, reference: ReferenceMode) -> Self {
        Self {
            start,
            duration,
            reference,
        }
    }

    /// Frame-by-frame subscription: newest data, no time window.
    pub fn by_frame() -> Self {
        Self::new(0.0, 0.0, ReferenceMode::Newest)
    }

    pub fn is_point(&self) -> bool {
        self.duration == 0.0
    }
}

/// One client-initiated data fetch or stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Requested channels in caller-facing names; payloads are passed through.
    pub channels: ChannelMap,
    pub start: f64,
    pub duration: f64,
    pub reference: ReferenceMode,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(id: RequestId, channels: ChannelMap, kind: RequestKind, window: RequestWindow) -> Self {
        Self {
            id,
            channels,
            start: window.start,
            duration: window.duration,
            reference: window.reference,
            kind,
        }
    }

    /// Point request (`duration == 0`) for the given channel names.
    pub fn one_shot<I, S>(id: RequestId, names: I, reference: ReferenceMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            ChannelMap::with_names(names),
            RequestKind::OneShot,
            RequestWindow::new(0.0, 0.0, reference),
        )
    }

    pub fn subscribe<I, S>(id: RequestId, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            ChannelMap::with_names(names),
            RequestKind::Subscribe,
            RequestWindow::by_frame(),
        )
    }

    pub fn window(&self) -> RequestWindow {
        RequestWindow::new(self.start, self.duration, self.reference)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.names()
    }

    pub fn folder_names(&self) -> &[String] {
        self.channels.folders()
    }

    pub fn is_registration(&self) -> bool {
        self.reference == ReferenceMode::Registration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_mode_parses_case_insensitively() {
        assert_eq!("Newest".parse::<ReferenceMode>(), Ok(ReferenceMode::Newest));
        assert_eq!(
            "registration".parse::<ReferenceMode>(),
            Ok(ReferenceMode::Registration)
        );
        assert!("sideways".parse::<ReferenceMode>().is_err());
    }

    #[test]
    fn reference_mode_display_matches_parse() {
        for mode in [
            ReferenceMode::Absolute,
            ReferenceMode::Newest,
            ReferenceMode::Oldest,
            ReferenceMode::Next,
            ReferenceMode::Registration,
        ] {
            assert_eq!(mode.to_string().parse::<ReferenceMode>(), Ok(mode));
        }
    }

    #[test]
    fn streaming_kinds() {
        assert!(!RequestKind::OneShot.is_streaming());
        assert!(RequestKind::Subscribe.is_streaming());
        assert!(RequestKind::Monitor.is_streaming());
    }

    #[test]
    fn one_shot_builder_is_a_point_request() {
        let req = Request::one_shot(RequestId::from_raw("A"), ["X"], ReferenceMode::Newest);
        assert_eq!(req.kind, RequestKind::OneShot);
        assert!(req.window().is_point());
        assert_eq!(req.channel_names().collect::<Vec<_>>(), ["X"]);
        assert!(!req.is_registration());
    }

    #[test]
    fn subscribe_builder_uses_frame_window() {
        let req = Request::subscribe(RequestId::from_raw("S"), ["a", "b"]);
        assert_eq!(req.window(), RequestWindow::by_frame());
        assert!(req.kind.is_streaming());
    }

    #[test]
    fn request_serde_uses_snake_case_enums() {
        let req = Request::one_shot(RequestId::from_raw("A"), ["X"], ReferenceMode::Oldest);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "one_shot");
        assert_eq!(json["reference"], "oldest");
    }
}
