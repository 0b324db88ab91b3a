use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use std::time::Duration;

pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Shared HTTP client for provider REST calls: exponential-backoff retry
    /// on transient failures, bounded timeouts. Order placement does NOT use
    /// this client; retrying a submitted order could double-fill it.
    pub fn create_client() -> ClientWithMiddleware {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build()
    }
}

/// Append query parameters to `base_url`, percent-encoded.
pub fn build_url_with_query<K, V>(base_url: &str, params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if params.is_empty() {
        return base_url.to_string();
    }

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
        .finish();

    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{separator}{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_with_query() {
        let url = build_url_with_query(
            "https://api.example.com/klines",
            &[("symbol", "BTCUSDT"), ("limit", "1000")],
        );
        assert_eq!(
            url,
            "https://api.example.com/klines?symbol=BTCUSDT&limit=1000"
        );
    }

    #[test]
    fn test_build_url_appends_to_existing_query() {
        let url = build_url_with_query("https://api.example.com/x?a=1", &[("b", "2")]);
        assert_eq!(url, "https://api.example.com/x?a=1&b=2");
    }

    #[test]
    fn test_build_url_encodes_values() {
        let url = build_url_with_query("https://api.example.com/x", &[("q", "a b&c")]);
        assert_eq!(url, "https://api.example.com/x?q=a+b%26c");
    }
}
