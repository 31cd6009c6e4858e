use tracing::warn;

use crate::channel::ChannelMap;
use crate::request::Request;

/// Client name used for the throwaway identity probe against the data source.
pub const PROBE_CLIENT_NAME: &str = "Route->X";

/// Last `/`-separated segment of a server or source path, ignoring a trailing slash.
pub fn last_segment(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Client name the workers use against the data source, derived from the
/// request-source server name.
pub fn route_client_name(request_server: &str) -> String {
    format!("Route->{}", last_segment(request_server))
}

/// Maps caller-facing channel names into the remote source and back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteNamespace {
    prefix: String,
}

/// Result batch translated back into caller-facing names.
#[derive(Debug, Default)]
pub struct LocalBatch {
    pub map: ChannelMap,
    /// Remote channel names that were not under the prefix and got dropped.
    pub unexpected: Vec<String>,
}

impl RemoteNamespace {
    /// `remote_source` is the data-source path requests are routed into.
    /// A trailing `/` is added when missing.
    pub fn new(remote_source: &str) -> Self {
        let mut prefix = remote_source.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Default broker client name: last segment of the remote source.
    pub fn default_client_name(&self) -> &str {
        last_segment(&self.prefix)
    }

    pub fn to_remote_name(&self, local: &str) -> String {
        format!("{}{}", self.prefix, local)
    }

    /// Prefix every channel and folder of the request. Channel payloads are
    /// carried along unchanged.
    pub fn to_remote(&self, request: &Request) -> ChannelMap {
        let mut remote = ChannelMap::new();
        for channel in request.channels.channels() {
            let idx = remote.add(self.to_remote_name(&channel.name));
            if channel.has_payload() || channel.mime.is_some() {
                if let Some(target) = remote.channel_mut(idx) {
                    target.copy_payload_from(channel);
                }
            }
        }
        for folder in request.folder_names() {
            remote.add_folder(self.to_remote_name(folder));
        }
        remote
    }

    /// Strip the prefix from a result batch.
    pub fn to_local(&self, remote: &ChannelMap) -> LocalBatch {
        let mut batch = LocalBatch::default();
        for folder in remote.folders() {
            if let Some(rest) = folder.strip_prefix(&self.prefix) {
                if !rest.is_empty() {
                    batch.map.add_folder(rest);
                }
            }
        }
        for channel in remote.channels() {
            match channel.name.strip_prefix(&self.prefix) {
                Some(rest) if !rest.is_empty() => {
                    let idx = batch.map.add(rest);
                    if let Some(target) = batch.map.channel_mut(idx) {
                        target.copy_payload_from(channel);
                    }
                }
                _ => {
                    warn!(channel = %channel.name, prefix = %self.prefix, "unexpected channel in result");
                    batch.unexpected.push(channel.name.clone());
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RequestId;
    use crate::request::ReferenceMode;

    #[test]
    fn prefix_gets_trailing_slash() {
        assert_eq!(RemoteNamespace::new("/Server/Src").prefix(), "/Server/Src/");
        assert_eq!(RemoteNamespace::new("/Server/Src/").prefix(), "/Server/Src/");
    }

    #[test]
    fn last_segment_handles_trailing_slash() {
        assert_eq!(last_segment("/Server/Src/"), "Src");
        assert_eq!(last_segment("/Gateway"), "Gateway");
        assert_eq!(last_segment("plain"), "plain");
    }

    #[test]
    fn client_names() {
        assert_eq!(route_client_name("/GW"), "Route->GW");
        assert_eq!(RemoteNamespace::new("/Sink/Data").default_client_name(), "Data");
    }

    #[test]
    fn request_channels_and_folders_are_prefixed() {
        let ns = RemoteNamespace::new("/S/src");
        let mut req = Request::one_shot(RequestId::from_raw("A"), ["C", "D/e"], ReferenceMode::Newest);
        req.channels.add_folder("sub/");
        let remote = ns.to_remote(&req);
        assert_eq!(remote.names().collect::<Vec<_>>(), ["/S/src/C", "/S/src/D/e"]);
        assert_eq!(remote.folders(), ["/S/src/sub/"]);
    }

    #[test]
    fn message_payload_passes_through() {
        let ns = RemoteNamespace::new("/S/src");
        let mut req = Request::one_shot(RequestId::from_raw("A"), ["C"], ReferenceMode::Newest);
        req.channels.put_string(0, "munge");
        let remote = ns.to_remote(&req);
        assert_eq!(remote.data_as_str(0), Some("munge"));
    }

    #[test]
    fn result_round_trips_to_caller_names() {
        let ns = RemoteNamespace::new("/S/src");
        let mut remote = ChannelMap::new();
        let idx = remote.add("/S/src/C");
        remote.put_data(idx, vec![9, 9], None);
        remote.add_folder("/S/src/sub/");
        remote.add_folder("/S/src/");

        let local = ns.to_local(&remote);
        assert_eq!(local.map.names().collect::<Vec<_>>(), ["C"]);
        assert_eq!(local.map.channel(0).unwrap().data, vec![9, 9]);
        assert_eq!(local.map.folders(), ["sub/"]);
        assert!(local.unexpected.is_empty());
    }

    #[test]
    fn channels_outside_prefix_are_dropped() {
        let ns = RemoteNamespace::new("/S/src");
        let remote = ChannelMap::with_names(["/Other/C", "/S/src/ok"]);
        let local = ns.to_local(&remote);
        assert_eq!(local.map.names().collect::<Vec<_>>(), ["ok"]);
        assert_eq!(local.unexpected, ["/Other/C"]);
    }
}
