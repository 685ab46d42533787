//! Two-source race between a direct fetch and the bypass service.

use crate::bypass::BypassClient;
use crate::error::ProviderError;
use crate::http_client::{DirectClient, PageResponse};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Which leg of the race produced the value
#[derive(Debug, Clone, PartialEq)]
pub enum Winner<T> {
    Direct(T),
    Bypass(T),
}

impl<T> Winner<T> {
    pub fn source(&self) -> &'static str {
        match self {
            Winner::Direct(_) => "direct",
            Winner::Bypass(_) => "bypass",
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Winner::Direct(v) | Winner::Bypass(v) => v,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("both sources failed (direct: {direct}; bypass: {bypass})")]
pub struct RaceError {
    pub direct: ProviderError,
    pub bypass: ProviderError,
}

/// Run both sources concurrently and return the first success.
///
/// A failed leg does not end the race; the other one is awaited. When both
/// are ready at the same poll the direct source wins. The losing future is
/// dropped, which cancels it.
pub async fn race_sources<T, D, B>(direct: D, bypass: B) -> Result<Winner<T>, RaceError>
where
    D: Future<Output = Result<T, ProviderError>>,
    B: Future<Output = Result<T, ProviderError>>,
{
    tokio::pin!(direct);
    tokio::pin!(bypass);

    let mut direct_err: Option<ProviderError> = None;
    let mut bypass_err: Option<ProviderError> = None;

    loop {
        tokio::select! {
            biased;

            res = &mut direct, if direct_err.is_none() => match res {
                Ok(value) => return Ok(Winner::Direct(value)),
                Err(e) => match bypass_err.take() {
                    Some(bypass) => return Err(RaceError { direct: e, bypass }),
                    None => direct_err = Some(e),
                },
            },

            res = &mut bypass, if bypass_err.is_none() => match res {
                Ok(value) => return Ok(Winner::Bypass(value)),
                Err(e) => match direct_err.take() {
                    Some(direct) => return Err(RaceError { direct, bypass: e }),
                    None => bypass_err = Some(e),
                },
            },
        }
    }
}

/// Fetch `url` directly and through the bypass service at the same time
pub async fn fetch_page(
    direct: &DirectClient,
    bypass: &BypassClient,
    url: &str,
    identity: Option<&str>,
) -> Result<Winner<PageResponse>, RaceError> {
    // Fired when the direct leg wins so the abandoned solve is not
    // reported as a bypass timeout
    let superseded = CancellationToken::new();
    let direct_leg = async {
        let page = direct.fetch_page(url).await;
        if page.is_ok() {
            superseded.cancel();
        }
        page
    };
    let bypass_leg = async {
        bypass
            .get_cancellable(url, identity, &superseded)
            .await
            .map(PageResponse::from)
            .map_err(ProviderError::from)
    };

    let winner = race_sources(direct_leg, bypass_leg).await?;
    log::debug!("Fetched {} via {}", url, winner.source());
    Ok(winner)
}
