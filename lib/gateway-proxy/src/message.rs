//! Value objects exchanged between the gateway and its backends

use http_body_util::Full;
use hyper::{body::Bytes, HeaderMap, Method, Response, StatusCode};
use url::{form_urlencoded, Url};

use crate::error::UpstreamError;

/// Parsed query string.
///
/// Kept as an ordered list of pairs so repeated keys (`tag=a&tag=b`)
/// survive the trip to the backend as repeated keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw query string (without the leading '?')
    pub fn parse(raw: &str) -> Self {
        Self(
            form_urlencoded::parse(raw.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        )
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// All values for `key`, in order of appearance
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize back to `application/x-www-form-urlencoded` form
    pub fn to_query_string(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.0 {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// An outbound request, built per call
#[derive(Clone, Debug)]
pub struct ForwardedRequest {
    pub method: Method,
    /// Target URL without the query string
    pub target_url: String,
    pub headers: HeaderMap,
    pub query_params: QueryParams,
    pub body: Bytes,
}

impl ForwardedRequest {
    /// A bodyless GET, as used by health probes
    pub fn get(target_url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            target_url: target_url.into(),
            headers: HeaderMap::new(),
            query_params: QueryParams::new(),
            body: Bytes::new(),
        }
    }

    /// Target URL with the query string appended
    pub fn full_url(&self) -> Result<Url, UpstreamError> {
        let mut url = Url::parse(&self.target_url)
            .map_err(|e| UpstreamError::Protocol(format!("invalid target URL {}: {}", self.target_url, e)))?;
        if !self.query_params.is_empty() {
            url.set_query(Some(&self.query_params.to_query_string()));
        }
        Ok(url)
    }
}

/// A backend response, returned verbatim to the caller
#[derive(Clone, Debug)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardedResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_keep_repeated_keys() {
        let params = QueryParams::parse("tag=a&tag=b&page=2");
        assert_eq!(params.get_all("tag").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(params.to_query_string(), "tag=a&tag=b&page=2");
    }

    #[test]
    fn test_query_params_decode_and_reencode() {
        let params = QueryParams::parse("q=rust%20basics&sort=-created");
        assert_eq!(params.get_all("q").next(), Some("rust basics"));
        assert_eq!(params.to_query_string(), "q=rust+basics&sort=-created");
    }

    #[test]
    fn test_full_url_with_repeated_query() {
        let mut request = ForwardedRequest::get("http://courses:9002/courses/search");
        request.query_params = [("tag", "a"), ("tag", "b")].into_iter().collect();
        assert_eq!(
            request.full_url().unwrap().as_str(),
            "http://courses:9002/courses/search?tag=a&tag=b"
        );
    }

    #[test]
    fn test_full_url_without_query() {
        let request = ForwardedRequest::get("http://auth:9001/auth/users/42");
        assert_eq!(request.full_url().unwrap().as_str(), "http://auth:9001/auth/users/42");
    }

    #[test]
    fn test_full_url_invalid() {
        let request = ForwardedRequest::get("not a url");
        assert!(matches!(request.full_url(), Err(UpstreamError::Protocol(_))));
    }

    #[test]
    fn test_forwarded_response_into_response() {
        let mut forwarded = ForwardedResponse::new(StatusCode::CREATED, "{\"id\":7}");
        forwarded
            .headers
            .insert("content-type", "application/json".parse().unwrap());
        let response = forwarded.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "application/json");
    }
}
