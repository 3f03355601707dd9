//! In-process `/health` probe used by the `-health-check` CLI flag, for
//! container health probes that would rather exec the binary than run curl.

pub async fn run(port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/health");
    match reqwest::Client::new().get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
