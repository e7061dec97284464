// nsqlookupd HTTP client.
//
// Discovery fans out to every configured lookupd in parallel and unions the
// producer sets, so a partially unavailable lookupd cluster degrades to
// whatever the reachable daemons know. Transient failures are logged and
// skipped; callers keep their last known topology.
use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;

use crate::addr::ServerAddress;
use crate::error::{Error, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct LookupClient {
    http: reqwest::Client,
    addresses: Vec<String>,
}

/// Both nsqlookupd response generations: 1.x returns the producer list at
/// the top level, older daemons wrap it in a `data` envelope.
#[derive(Deserialize)]
struct ProducerList {
    #[serde(default)]
    producers: Vec<ProducerEntry>,
    data: Option<ProducerData>,
}

#[derive(Deserialize)]
struct ProducerData {
    #[serde(default)]
    producers: Vec<ProducerEntry>,
}

#[derive(Deserialize)]
struct ProducerEntry {
    broadcast_address: String,
    tcp_port: u16,
    http_port: u16,
}

impl ProducerList {
    fn into_addresses(self) -> impl Iterator<Item = ServerAddress> {
        let producers = if self.producers.is_empty() {
            self.data.map(|data| data.producers).unwrap_or_default()
        } else {
            self.producers
        };
        producers.into_iter().map(|entry| {
            ServerAddress::with_http_port(entry.broadcast_address, entry.tcp_port, entry.http_port)
        })
    }
}

impl LookupClient {
    /// `addresses` are lookupd HTTP base URLs, e.g. `http://lookupd-1:4161`.
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addresses: addresses
                .into_iter()
                .map(|address| address.trim_end_matches('/').to_string())
                .collect(),
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Resolve the nsqd set currently producing `topic`.
    ///
    /// An empty result triggers topic auto-creation on every known nsqd and
    /// one lookup retry, so subscribing to a topic nobody has published to
    /// yet still converges.
    pub async fn lookup(&self, topic: &str) -> Result<HashSet<ServerAddress>> {
        if self.addresses.is_empty() {
            return Err(Error::NoAddresses);
        }
        let found = self.query("/lookup", &[("topic", topic)]).await;
        if !found.is_empty() {
            return Ok(found);
        }
        self.create_topic(topic).await;
        Ok(self.query("/lookup", &[("topic", topic)]).await)
    }

    /// Every nsqd known to the lookupd cluster, regardless of topic.
    pub async fn lookup_nodes(&self) -> Result<HashSet<ServerAddress>> {
        if self.addresses.is_empty() {
            return Err(Error::NoAddresses);
        }
        Ok(self.query("/nodes", &[]).await)
    }

    async fn query(&self, path: &str, params: &[(&str, &str)]) -> HashSet<ServerAddress> {
        let requests = self.addresses.iter().map(|base| {
            let url = format!("{base}{path}");
            async move {
                match self.fetch(&url, params).await {
                    Ok(list) => Some(list),
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "lookupd query failed");
                        None
                    }
                }
            }
        });
        join_all(requests)
            .await
            .into_iter()
            .flatten()
            .flat_map(ProducerList::into_addresses)
            .collect()
    }

    // Topic names travel as query parameters so reserved characters are
    // escaped rather than spliced into the path.
    async fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Result<ProducerList> {
        let response = self
            .http
            .get(url)
            .query(params)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ProducerList>().await?)
    }

    /// Best-effort topic creation on every nsqd the cluster knows about.
    async fn create_topic(&self, topic: &str) {
        let nodes = self.query("/nodes", &[]).await;
        if nodes.is_empty() {
            tracing::warn!(topic, "no nsqd nodes available for topic creation");
            return;
        }
        let requests = nodes.iter().map(|node| {
            let url = format!("{}/topic/create", node.http_address());
            async move {
                let result = self
                    .http
                    .post(&url)
                    .query(&[("topic", topic)])
                    .timeout(HTTP_TIMEOUT)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status());
                if let Err(err) = result {
                    tracing::warn!(url = %url, error = %err, "topic creation failed");
                }
            }
        });
        join_all(requests).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modern_lookup_response() {
        let raw = r#"{
            "channels": [],
            "producers": [
                {"broadcast_address": "nsqd-1", "tcp_port": 4150, "http_port": 4151, "version": "1.2.1"}
            ]
        }"#;
        let list: ProducerList = serde_json::from_str(raw).expect("parse");
        let addresses: Vec<_> = list.into_addresses().collect();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].to_string(), "nsqd-1:4150");
        assert_eq!(addresses[0].http_address(), "http://nsqd-1:4151");
    }

    #[test]
    fn parses_legacy_data_envelope() {
        let raw = r#"{
            "status_code": 200,
            "status_txt": "OK",
            "data": {
                "producers": [
                    {"broadcast_address": "nsqd-2", "tcp_port": 4150, "http_port": 4151}
                ]
            }
        }"#;
        let list: ProducerList = serde_json::from_str(raw).expect("parse");
        let addresses: Vec<_> = list.into_addresses().collect();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].to_string(), "nsqd-2:4150");
    }

    #[test]
    fn trailing_slashes_are_normalized() {
        let client = LookupClient::new(vec!["http://lookupd:4161/".to_string()]);
        assert_eq!(client.addresses(), ["http://lookupd:4161"]);
    }

    #[tokio::test]
    async fn empty_address_list_is_rejected() {
        let client = LookupClient::new(Vec::new());
        let err = client.lookup("topic").await.expect_err("no addresses");
        assert!(matches!(err, Error::NoAddresses));
    }
}
