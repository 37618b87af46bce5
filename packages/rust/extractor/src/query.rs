//! Results-page request composition. Pure construction, no network.

use url::Url;

use questiontree_shared::{Device, ExtractionParams, QuestionTreeError, Result};

/// A composed results-page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    /// Extra request headers (language and device hints).
    pub headers: Vec<(String, String)>,
    pub device: Device,
}

/// Build the results-page request for `params` against `base_url`.
///
/// The city-bias token is appended as-is: it arrives pre-encoded and must not
/// be re-encoded here.
pub fn compose(params: &ExtractionParams, base_url: &str) -> Result<PageRequest> {
    let mut url = Url::parse(base_url)
        .map_err(|e| QuestionTreeError::config(format!("invalid search base URL: {e}")))?;

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("q", &params.keyword);
        if !params.language.is_empty() {
            pairs.append_pair("hl", &params.language);
        }
        if !params.country.is_empty() {
            pairs.append_pair("gl", &params.country);
        }
        pairs.append_pair("pws", "0");
        pairs.append_pair("ie", "UTF-8");
    }

    let mut url = url.to_string();
    if let Some(token) = &params.city_bias {
        url.push_str("&uule=");
        url.push_str(token);
    }

    let mut headers = vec![("Accept-Language".to_string(), accept_language(params))];
    headers.push((
        "Sec-CH-UA-Mobile".to_string(),
        match params.device {
            Device::Mobile => "?1".to_string(),
            Device::Desktop => "?0".to_string(),
        },
    ));

    Ok(PageRequest {
        url,
        headers,
        device: params.device,
    })
}

fn accept_language(params: &ExtractionParams) -> String {
    if params.country.is_empty() {
        format!("{},en;q=0.5", params.language)
    } else {
        format!("{},{};q=0.9,en;q=0.5", params.locale(), params.language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.google.com/search";

    fn params() -> ExtractionParams {
        ExtractionParams::new("best running shoes", "de", "de", Device::Mobile).unwrap()
    }

    #[test]
    fn compose_sets_locale_and_disables_personalization() {
        let request = compose(&params(), BASE).unwrap();
        assert!(request.url.starts_with("https://www.google.com/search?q=best+running+shoes"));
        assert!(request.url.contains("hl=de"));
        assert!(request.url.contains("gl=de"));
        assert!(request.url.contains("pws=0"));
        assert!(!request.url.contains("uule"));
    }

    #[test]
    fn city_bias_is_appended_verbatim() {
        let token = "w+CAIQICIGQmVybGlu%3D";
        let request = compose(&params().with_city_bias(Some(token.into())), BASE).unwrap();
        assert!(request.url.ends_with(&format!("&uule={token}")));
    }

    #[test]
    fn device_hints() {
        let mobile = compose(&params(), BASE).unwrap();
        assert!(mobile.headers.contains(&("Sec-CH-UA-Mobile".into(), "?1".into())));
        assert!(mobile.headers.contains(&("Accept-Language".into(), "de-DE,de;q=0.9,en;q=0.5".into())));

        let mut desktop = params();
        desktop.device = Device::Desktop;
        let desktop = compose(&desktop, BASE).unwrap();
        assert!(desktop.headers.contains(&("Sec-CH-UA-Mobile".into(), "?0".into())));
        assert_eq!(desktop.device, Device::Desktop);
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let err = compose(&params(), "not a url").unwrap_err();
        assert!(err.to_string().contains("search base URL"));
    }
}
