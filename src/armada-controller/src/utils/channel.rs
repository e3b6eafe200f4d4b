pub(crate) type Sender<T> = tokio::sync::mpsc::Sender<T>;
pub(crate) type Receiver<T> = tokio::sync::mpsc::Receiver<T>;

pub(crate) fn create_channel<T>(buffer_size: usize) -> (Sender<T>, Receiver<T>) {
    tokio::sync::mpsc::channel(buffer_size)
}

pub(crate) type OneshotSender<T> = tokio::sync::oneshot::Sender<T>;
pub(crate) type OneshotReceiver<T> = tokio::sync::oneshot::Receiver<T>;

pub(crate) fn create_oneshot_channel<T>() -> (OneshotSender<T>, OneshotReceiver<T>) {
    tokio::sync::oneshot::channel()
}
