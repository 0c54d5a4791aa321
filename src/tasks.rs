use std::future::Future;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

/// Run `driver` and yield everything it sends into `events`.
///
/// The stream ends once the driver has finished and every sender is gone,
/// so events sent from drop guards still come through.
pub fn with_events<T, Fut>(driver: Fut, events: mpsc::UnboundedReceiver<T>) -> impl Stream<Item = T>
where
    Fut: Future<Output = ()> + Send + 'static,
    T: Send + 'static,
{
    let driver = futures_util::stream::once(driver)
        .filter_map(|_| futures_util::future::ready(None::<T>));
    let events = futures_util::stream::unfold(events, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    });
    futures_util::stream::select(driver, events)
}
