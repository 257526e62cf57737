//! Local HTTP stub for driving the fetcher in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves one `(status, body)` reply per connection, in order, then stops
/// accepting. Returns the stub's `/rank` URL and a connection counter.
pub async fn serve_canned<B: Into<String>>(
    responses: Vec<(u16, B)>,
) -> std::io::Result<(String, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let responses: Vec<(u16, String)> = responses
        .into_iter()
        .map(|(status, body)| (status, body.into()))
        .collect();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 {status} Canned\r\n\
                 content-type: application/json\r\n\
                 content-length: {}\r\n\
                 connection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    Ok((format!("http://{addr}/rank"), hits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_in_order_and_counts_connections() {
        let (url, hits) = serve_canned(vec![(503, "busy"), (200, "{\"ok\":true}")])
            .await
            .unwrap();
        let client = reqwest::Client::new();

        let first = client.get(&url).send().await.unwrap();
        assert_eq!(first.status().as_u16(), 503);
        let second = client.get(&url).send().await.unwrap();
        assert_eq!(second.status().as_u16(), 200);
        assert_eq!(second.text().await.unwrap(), "{\"ok\":true}");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
