//! The list pipeline: one producer task streaming `FileDetails` over a
//! bounded channel, exposed to the caller as a lazy iterator.

use std::sync::Arc;

use anyhow::Result;

use crate::backend::{
    new_client, FileDetails, ListDirTask, ListSummary, ERROR_CHANNEL_CAPACITY,
    FILE_CHANNEL_CAPACITY,
};

/// Starts an enumeration of `task.source` and returns the iterator over its
/// results. Returns an error directly when the source client cannot be
/// constructed; enumeration failures surface through [`DirList::err`].
pub async fn list_dir(task: &mut ListDirTask) -> Result<DirList> {
    let client = new_client(&mut task.source)?;
    tracing::info!("list task from {}", task.source);

    let (item_tx, item_rx) = async_channel::bounded(FILE_CHANNEL_CAPACITY);
    let (error_tx, error_rx) = async_channel::bounded(ERROR_CHANNEL_CAPACITY);
    let summary = Arc::new(ListSummary::default());

    let producer_task = task.clone();
    let producer_summary = summary.clone();
    tokio::spawn(async move {
        // the sender moves into list_dir and is dropped on return, which
        // closes the channel on every exit path
        if let Err(error) = client
            .list_dir(item_tx, &producer_task, &producer_summary)
            .await
        {
            tracing::error!("directory listing failed: {:#}", error);
            let _ = error_tx.send(error).await;
        }
    });

    Ok(DirList {
        items: item_rx,
        errors: error_rx,
        summary,
        current: None,
        error: None,
    })
}

/// Lazy iterator over one enumeration. Dropping it closes the channel and
/// quietly unwinds the producer.
pub struct DirList {
    items: async_channel::Receiver<FileDetails>,
    errors: async_channel::Receiver<anyhow::Error>,
    summary: Arc<ListSummary>,
    current: Option<FileDetails>,
    error: Option<anyhow::Error>,
}

impl DirList {
    /// Blocks until the next item is available, or returns `None` once the
    /// enumeration has finished. On exhaustion the producer's terminal
    /// error, if any, becomes available through [`DirList::err`].
    pub async fn next(&mut self) -> Option<&FileDetails> {
        match self.items.recv().await {
            Ok(details) => {
                self.current = Some(details);
                self.current.as_ref()
            }
            Err(_) => {
                if self.error.is_none() {
                    // the item channel closes before the producer posts its
                    // error; waiting here is bounded because the producer
                    // drops its error sender right after
                    self.error = self.errors.recv().await.ok();
                }
                self.current = None;
                None
            }
        }
    }

    /// The currently positioned item.
    pub fn at(&self) -> Option<&FileDetails> {
        self.current.as_ref()
    }

    /// Drains the whole enumeration, failing with the producer's terminal
    /// error when there is one.
    pub async fn read_all(&mut self) -> Result<Vec<FileDetails>> {
        let mut all = vec![];
        while let Some(details) = self.next().await {
            all.push(details.clone());
        }
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(all),
        }
    }

    /// Running totals; final once the enumeration has been drained.
    pub fn summary(&self) -> &ListSummary {
        &self.summary
    }

    /// The sticky terminal error, set once the channel has been drained.
    pub fn err(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }
}
