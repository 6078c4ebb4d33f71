use log::{debug, info, warn};
use reqwest::Url;
use serde::Deserialize;

use super::Server;
use crate::error::EngineError;
use crate::settings::Settings;

/// Catalog documents are either a bare array or wrapped in `{"servers": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    List(Vec<Server>),
    Wrapped { servers: Vec<Server> },
}

impl CatalogDocument {
    fn into_servers(self) -> Vec<Server> {
        match self {
            CatalogDocument::List(servers) | CatalogDocument::Wrapped { servers } => servers,
        }
    }
}

/// Loads the candidate servers in catalog order.
pub async fn load_servers(
    settings: &Settings,
    client: &reqwest::Client,
) -> Result<Vec<Server>, EngineError> {
    let fetch_error = match settings.server_list_url.as_deref() {
        Some(url) => match fetch_catalog(client, url).await {
            Ok(raw) => {
                let servers = normalize(raw, settings);
                if !servers.is_empty() {
                    info!("Loaded {} servers from {}", servers.len(), url);
                    return Ok(servers);
                }
                format!("catalog at {url} has no usable servers")
            }
            Err(err) => {
                warn!("Failed to fetch server list from {url}: {err}");
                format!("fetching {url} failed: {err}")
            }
        },
        None => "no server list URL configured".to_string(),
    };

    let servers = normalize(settings.static_servers.clone(), settings);
    if servers.is_empty() {
        return Err(EngineError::CatalogUnavailable(format!(
            "{fetch_error} and no static servers are configured"
        )));
    }
    debug!("Using {} static servers", servers.len());
    Ok(servers)
}

async fn fetch_catalog(client: &reqwest::Client, url: &str) -> reqwest::Result<Vec<Server>> {
    let document: CatalogDocument = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(document.into_servers())
}

/// Fills derived fields and drops entries whose URL cannot be used.
pub fn normalize(servers: Vec<Server>, settings: &Settings) -> Vec<Server> {
    servers
        .into_iter()
        .enumerate()
        .filter_map(|(index, mut server)| {
            let url = match Url::parse(&server.url) {
                Ok(url) => url,
                Err(err) => {
                    warn!("Skipping server {:?}: bad url {:?} ({err})", server.id, server.url);
                    return None;
                }
            };
            if server.host.is_empty() {
                server.host = url.host_str()?.to_string();
            }
            if server.id.is_empty() {
                server.id = index.to_string();
            }
            if server.distance_km.is_none() {
                if let (Some(client), Some(location)) =
                    (settings.client_location, server.location())
                {
                    server.distance_km = Some(client.distance_km(&location));
                }
            }
            server.latency_ms = None;
            Some(server)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedtest::Location;

    #[test]
    fn document_accepts_both_shapes() {
        let list: CatalogDocument =
            serde_json::from_str(r#"[{"id": "1", "url": "http://a.test"}]"#).unwrap();
        assert_eq!(list.into_servers().len(), 1);

        let wrapped: CatalogDocument = serde_json::from_str(
            r#"{"servers": [{"url": "http://a.test"}, {"url": "http://b.test"}]}"#,
        )
        .unwrap();
        assert_eq!(wrapped.into_servers().len(), 2);
    }

    #[test]
    fn normalize_derives_host_id_and_distance() {
        let settings = Settings {
            client_location: Some(Location { lat: 0.0, lon: 0.0 }),
            ..Settings::default()
        };
        let mut far = Server::new("", "", "https://far.example.net:8080/speed");
        far.lat = Some(0.0);
        far.lon = Some(1.0);
        let servers = normalize(
            vec![
                Server::new("x", "", "not a url"),
                far,
                Server::new("near", "near.example.net", "http://10.0.0.1").with_distance(3.0),
            ],
            &settings,
        );

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].id, "1");
        assert_eq!(servers[0].host, "far.example.net");
        let distance = servers[0].distance_km.unwrap();
        assert!((distance - 111.2).abs() < 0.5, "distance={distance}");
        assert_eq!(servers[1].host, "near.example.net");
        assert_eq!(servers[1].distance_km, Some(3.0));
    }

    #[tokio::test]
    async fn static_servers_bypass_fetch() {
        let settings = Settings::default();
        let servers = load_servers(&settings, &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(servers[0].host, "speed.cloudflare.com");
    }

    #[tokio::test]
    async fn no_source_is_catalog_unavailable() {
        let settings = Settings {
            server_list_url: Some("http://127.0.0.1:1/servers.json".to_string()),
            static_servers: Vec::new(),
            ..Settings::default()
        };
        let err = load_servers(&settings, &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CatalogUnavailable(_)));
    }

    #[tokio::test]
    async fn failed_fetch_falls_back_to_static() {
        let settings = Settings {
            server_list_url: Some("http://127.0.0.1:1/servers.json".to_string()),
            ..Settings::default()
        };
        let servers = load_servers(&settings, &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "cloudflare");
    }
}
