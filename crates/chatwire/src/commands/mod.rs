use async_trait::async_trait;
use eyre::Result;

pub mod checkpoint;
pub mod connect;
pub mod replay;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}
