use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use drivepin_core::{DriveApiError, DriveClient, FileMetadata, Id, QueryItem, QueryParameters};
use futures_util::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("file service error: {0}")]
    Api(#[from] DriveApiError),
    #[error("item {0} not found")]
    NotFound(Id),
    #[error("{0}")]
    Failed(String),
}

/// Operations the pin manager needs from the remote file service.
pub trait FileService: Send + Sync + 'static {
    type Listing: Listing;

    fn start_listing(&self, query: QueryParameters) -> Self::Listing;

    fn pin_by_id(
        &self,
        id: Id,
        pinned: bool,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    fn metadata_by_id(
        &self,
        id: Id,
    ) -> impl Future<Output = Result<FileMetadata, ServiceError>> + Send;
}

/// Cursor over the paginated item listing. An empty page marks the end.
pub trait Listing: Send + 'static {
    fn next_page(&mut self) -> impl Future<Output = Result<Vec<QueryItem>, ServiceError>> + Send;
}

/// Asynchronously reports the free space available at a path.
pub type SpaceGetter = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, io::Result<u64>> + Send + Sync>;

pub fn default_space_getter() -> SpaceGetter {
    Arc::new(|path: PathBuf| -> BoxFuture<'static, io::Result<u64>> {
        Box::pin(get_free_space(path))
    })
}

/// `statvfs` may block on slow mounts, so it runs on the blocking pool.
pub async fn get_free_space(path: PathBuf) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || fs2::available_space(&path))
        .await
        .map_err(io::Error::other)?
}

impl FileService for DriveClient {
    type Listing = DriveListing;

    fn start_listing(&self, query: QueryParameters) -> DriveListing {
        DriveListing {
            client: self.clone(),
            query,
            page_token: None,
            exhausted: false,
        }
    }

    async fn pin_by_id(&self, id: Id, pinned: bool) -> Result<(), ServiceError> {
        self.set_pinned_by_id(id, pinned).await?;
        Ok(())
    }

    async fn metadata_by_id(&self, id: Id) -> Result<FileMetadata, ServiceError> {
        match self.get_metadata_by_id(id).await {
            Ok(metadata) => Ok(metadata),
            Err(err) if err.is_not_found() => Err(ServiceError::NotFound(id)),
            Err(err) => Err(err.into()),
        }
    }
}

pub struct DriveListing {
    client: DriveClient,
    query: QueryParameters,
    page_token: Option<String>,
    exhausted: bool,
}

impl Listing for DriveListing {
    async fn next_page(&mut self) -> Result<Vec<QueryItem>, ServiceError> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let page = self
            .client
            .list_page(&self.query, self.page_token.as_deref())
            .await?;
        self.page_token = page.next_page_token.filter(|token| !token.is_empty());
        if self.page_token.is_none() {
            self.exhausted = true;
        }
        Ok(page.items.unwrap_or_default())
    }
}
