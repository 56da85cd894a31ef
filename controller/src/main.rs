#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(all(not(feature = "esp32"), not(feature = "factory-reset")))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

#[cfg(all(not(feature = "esp32"), feature = "factory-reset"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::format().await
}

#[cfg(all(feature = "esp32", not(feature = "factory-reset")))]
fn main() -> anyhow::Result<()> {
    esp::run()
}

#[cfg(all(feature = "esp32", feature = "factory-reset"))]
fn main() -> anyhow::Result<()> {
    esp::format()
}
