//! Pipelined video execution: a decoder stage, a pool of transform workers
//! and an encoder stage, connected by bounded channels.
//!
//! Workers may finish frames out of order; the encoder keeps a reorder buffer
//! keyed by frame index and writes strictly in read order. The number of
//! frames in flight (decoded but not yet written) is capped at
//! `buffer_size + workers` by a ticket channel, so a slow worker stalls the
//! decoder instead of growing the reorder buffer.
//!
//! Every blocking channel wait also watches a shared stop signal, so a
//! failure in one stage wakes stages parked on another.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::frame::Frame;
use crate::video::{
    EndReason, FrameSink, FrameSource, FrameTransform, PipelineReport, ProgressCallback,
};

pub const DEFAULT_BUFFER_SIZE: usize = 4;

pub struct IndexedFrame {
    pub index: u64,
    pub frame: Frame,
}

impl IndexedFrame {
    pub fn new(index: u64, frame: Frame) -> Self {
        Self { index, frame }
    }
}

struct DecodeOutcome {
    frames_read: u64,
    end_reason: EndReason,
}

/// Stop signal shared by all stages. `failed` separates a stage error from a
/// requested cancel, since only the latter finishes the sink.
struct StageControl {
    stop_tx: watch::Sender<bool>,
    failed: AtomicBool,
    runtime: Handle,
}

impl StageControl {
    fn new(stopped: bool, runtime: Handle) -> Self {
        let (stop_tx, _) = watch::channel(stopped);
        Self {
            stop_tx,
            failed: AtomicBool::new(false),
            runtime,
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.stop();
    }

    /// Blocking receive that returns `None` once the stop signal is raised.
    fn recv<T>(&self, rx: &mut mpsc::Receiver<T>) -> Option<T> {
        let mut stop = self.stop_tx.subscribe();
        self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => None,
                item = rx.recv() => item,
            }
        })
    }

    /// Blocking send; `false` when the receiver is gone or the stop signal is
    /// raised first.
    fn send<T>(&self, tx: &mpsc::Sender<T>, item: T) -> bool {
        let mut stop = self.stop_tx.subscribe();
        self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => false,
                sent = tx.send(item) => sent.is_ok(),
            }
        })
    }
}

pub struct StreamingExecutor {
    buffer_size: usize,
    workers: usize,
}

impl StreamingExecutor {
    pub fn new(buffer_size: usize, workers: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            workers: workers.max(1),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn in_flight_limit(&self) -> usize {
        self.buffer_size + self.workers
    }

    pub async fn execute<S, T, K>(
        &self,
        source: S,
        transform: Arc<T>,
        sink: K,
        cancel: watch::Receiver<bool>,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<PipelineReport>
    where
        S: FrameSource + 'static,
        T: FrameTransform + ?Sized + 'static,
        K: FrameSink + 'static,
    {
        let frame_rate = source.frame_rate();
        let total_frames = source.frame_count_hint();
        let external_cancel = cancel.clone();

        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();
        let control = Arc::new(StageControl::new(*external_cancel.borrow(), Handle::current()));

        let external_cancel_handle = spawn_external_cancel_watcher(cancel, control.clone());

        let window = self.in_flight_limit();
        let (ticket_tx, ticket_rx) = mpsc::channel::<()>(window);
        for _ in 0..window {
            ticket_tx
                .try_send(())
                .map_err(|_| anyhow!("in-flight ticket channel refused initial fill"))?;
        }

        let (work_tx, work_rx) = mpsc::channel::<IndexedFrame>(self.buffer_size);
        let (done_tx, done_rx) = mpsc::channel::<IndexedFrame>(self.buffer_size);

        let decoder_handle = spawn_decoder_stage(
            source,
            work_tx,
            ticket_rx,
            control.clone(),
            error_tx.clone(),
        );

        let work_rx = Arc::new(Mutex::new(work_rx));
        let worker_handles: Vec<_> = (0..self.workers)
            .map(|worker| {
                spawn_worker_stage(
                    worker,
                    transform.clone(),
                    work_rx.clone(),
                    done_tx.clone(),
                    control.clone(),
                    error_tx.clone(),
                )
            })
            .collect();
        drop(done_tx);

        let encoder_handle = spawn_encoder_stage(
            sink,
            done_rx,
            ticket_tx,
            total_frames,
            progress_callback,
            control.clone(),
            error_tx.clone(),
        );

        drop(error_tx);

        let mut first_error: Option<anyhow::Error> = None;
        let mut note_panic = |stage: &str, join_error: tokio::task::JoinError| {
            control.fail();
            if first_error.is_none() {
                first_error = Some(anyhow!("{stage} task panicked: {join_error}"));
            }
        };

        let decode = match decoder_handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                note_panic("decoder", join_error);
                None
            }
        };
        for handle in worker_handles {
            if let Err(join_error) = handle.await {
                note_panic("worker", join_error);
            }
        }
        let frames_written = match encoder_handle.await {
            Ok(written) => written,
            Err(join_error) => {
                note_panic("encoder", join_error);
                0
            }
        };

        while let Some(error) = error_rx.recv().await {
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        control.stop();
        external_cancel_handle.abort();
        if let Err(join_error) = external_cancel_handle.await {
            if !join_error.is_cancelled() && first_error.is_none() {
                first_error = Some(anyhow!("external cancel watcher failed: {join_error}"));
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        let decode = decode.ok_or_else(|| anyhow!("decoder stage produced no outcome"))?;
        let externally_cancelled = *external_cancel.borrow();
        let end_reason = if decode.end_reason == EndReason::Cancelled
            || (externally_cancelled && frames_written < decode.frames_read)
        {
            EndReason::Cancelled
        } else {
            decode.end_reason
        };

        Ok(PipelineReport {
            frames_read: decode.frames_read,
            frames_written,
            frame_rate,
            end_reason,
        })
    }
}

impl Default for StreamingExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, 1)
    }
}

fn spawn_external_cancel_watcher(
    mut cancel: watch::Receiver<bool>,
    control: Arc<StageControl>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // A dropped sender means nobody can cancel any more.
        if cancel.wait_for(|cancelled| *cancelled).await.is_ok() {
            control.stop();
        }
    })
}

fn spawn_decoder_stage<S>(
    mut source: S,
    output: mpsc::Sender<IndexedFrame>,
    tickets: mpsc::Receiver<()>,
    control: Arc<StageControl>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<Option<DecodeOutcome>>
where
    S: FrameSource + 'static,
{
    tokio::task::spawn_blocking(move || {
        match run_decoder_loop(&mut source, output, tickets, &control) {
            Ok(outcome) => Some(outcome),
            Err(error) => {
                report_task_error(
                    &error_tx,
                    &control,
                    error.context("decoder stage failed"),
                );
                None
            }
        }
    })
}

fn spawn_worker_stage<T>(
    worker: usize,
    transform: Arc<T>,
    input: Arc<Mutex<mpsc::Receiver<IndexedFrame>>>,
    output: mpsc::Sender<IndexedFrame>,
    control: Arc<StageControl>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<()>
where
    T: FrameTransform + ?Sized + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = run_worker_loop(worker, transform.as_ref(), &input, &output, &control);
        if let Err(error) = result {
            report_task_error(
                &error_tx,
                &control,
                error.context(format!("transform worker {worker} failed")),
            );
        }
        // The encoder must observe the failure before this sender closes.
        drop(output);
    })
}

fn spawn_encoder_stage<K>(
    mut sink: K,
    input: mpsc::Receiver<IndexedFrame>,
    tickets: mpsc::Sender<()>,
    total_frames: Option<u64>,
    progress_callback: Option<ProgressCallback>,
    control: Arc<StageControl>,
    error_tx: mpsc::UnboundedSender<anyhow::Error>,
) -> tokio::task::JoinHandle<u64>
where
    K: FrameSink + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut written = 0_u64;
        let result = run_encoder_loop(
            &mut sink,
            input,
            tickets,
            total_frames,
            progress_callback,
            &control,
            &mut written,
        );

        match result {
            Ok(()) if control.has_failed() => {
                warn!(frames_written = written, "Discarding unfinished output after a stage failure");
                drop(sink);
            }
            Ok(()) => {
                // Finish on cancel too, so frames already written stay playable.
                if let Err(error) = sink.finish().context("encoder finish failed") {
                    report_task_error(
                        &error_tx,
                        &control,
                        error.context("encoder stage failed while finalizing"),
                    );
                }
            }
            Err(error) => {
                report_task_error(&error_tx, &control, error.context("encoder stage failed"));
            }
        }
        written
    })
}

fn run_decoder_loop<S>(
    source: &mut S,
    output: mpsc::Sender<IndexedFrame>,
    mut tickets: mpsc::Receiver<()>,
    control: &StageControl,
) -> Result<DecodeOutcome>
where
    S: FrameSource,
{
    let mut index = 0_u64;
    let mut total_decode_ms = 0.0_f64;
    let mut total_wait_ms = 0.0_f64;

    let end_reason = loop {
        if control.is_stopped() {
            break EndReason::Cancelled;
        }

        let t_wait = std::time::Instant::now();
        if control.recv(&mut tickets).is_none() {
            // Stopped, or the encoder went away.
            break EndReason::Cancelled;
        }
        total_wait_ms += t_wait.elapsed().as_secs_f64() * 1000.0;

        let t_decode = std::time::Instant::now();
        let frame = match source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break EndReason::EndOfStream,
            Err(error) => {
                warn!(frames_read = index, "stopping at frame read failure: {error:#}");
                break EndReason::ReadFailure;
            }
        };
        total_decode_ms += t_decode.elapsed().as_secs_f64() * 1000.0;

        let t_send = std::time::Instant::now();
        if !control.send(&output, IndexedFrame::new(index, frame)) {
            break EndReason::Cancelled;
        }
        total_wait_ms += t_send.elapsed().as_secs_f64() * 1000.0;

        index = index.saturating_add(1);
    };

    if index > 0 {
        tracing::info!(
            frames = index,
            avg_decode_ms = format!("{:.1}", total_decode_ms / index as f64),
            avg_wait_ms = format!("{:.1}", total_wait_ms / index as f64),
            total_decode_ms = format!("{:.0}", total_decode_ms),
            end_reason = ?end_reason,
            "Decoder stage summary"
        );
    }

    Ok(DecodeOutcome {
        frames_read: index,
        end_reason,
    })
}

fn run_worker_loop<T>(
    worker: usize,
    transform: &T,
    input: &Mutex<mpsc::Receiver<IndexedFrame>>,
    output: &mpsc::Sender<IndexedFrame>,
    control: &StageControl,
) -> Result<()>
where
    T: FrameTransform + ?Sized,
{
    let mut frame_count = 0_u64;
    let mut total_recv_ms = 0.0_f64;
    let mut total_process_ms = 0.0_f64;

    loop {
        if control.is_stopped() {
            break;
        }

        let t_recv = std::time::Instant::now();
        let next = {
            let mut queue = input
                .lock()
                .map_err(|_| anyhow!("work queue lock poisoned"))?;
            control.recv(&mut queue)
        };
        let Some(indexed_frame) = next else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        let index = indexed_frame.index;
        let t_process = std::time::Instant::now();
        let frame = transform
            .transform(&indexed_frame.frame)
            .with_context(|| format!("failed to transform frame {index}"))?;
        total_process_ms += t_process.elapsed().as_secs_f64() * 1000.0;

        if !control.send(output, IndexedFrame::new(index, frame)) {
            break;
        }
        frame_count += 1;
    }

    if frame_count > 0 {
        tracing::info!(
            worker,
            frames = frame_count,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / frame_count as f64),
            avg_process_ms = format!("{:.1}", total_process_ms / frame_count as f64),
            total_process_ms = format!("{:.0}", total_process_ms),
            "Worker stage summary"
        );
    }

    Ok(())
}

fn run_encoder_loop<K>(
    sink: &mut K,
    mut input: mpsc::Receiver<IndexedFrame>,
    tickets: mpsc::Sender<()>,
    total_frames: Option<u64>,
    progress_callback: Option<ProgressCallback>,
    control: &StageControl,
    written: &mut u64,
) -> Result<()>
where
    K: FrameSink,
{
    let mut pending: BTreeMap<u64, Frame> = BTreeMap::new();
    let mut max_pending = 0_usize;
    let mut total_recv_ms = 0.0_f64;
    let mut total_encode_ms = 0.0_f64;

    loop {
        if control.is_stopped() {
            break;
        }

        let t_recv = std::time::Instant::now();
        let Some(indexed_frame) = control.recv(&mut input) else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        pending.insert(indexed_frame.index, indexed_frame.frame);
        max_pending = max_pending.max(pending.len());

        while let Some(frame) = pending.remove(written) {
            let t_enc = std::time::Instant::now();
            sink.write_frame(&frame)
                .with_context(|| format!("failed to encode frame {written}"))?;
            total_encode_ms += t_enc.elapsed().as_secs_f64() * 1000.0;

            *written = written.saturating_add(1);
            let _ = tickets.try_send(());

            if let Some(callback) = progress_callback.as_ref() {
                callback(*written, total_frames);
            }
        }
    }

    if !pending.is_empty() && !control.is_stopped() {
        bail!(
            "{} transformed frames never became writable; frame {} is missing",
            pending.len(),
            written
        );
    }

    if *written > 0 {
        tracing::info!(
            frames = *written,
            max_reorder_depth = max_pending,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / *written as f64),
            avg_encode_ms = format!("{:.1}", total_encode_ms / *written as f64),
            total_encode_ms = format!("{:.0}", total_encode_ms),
            "Encoder stage summary"
        );
    }

    Ok(())
}

fn report_task_error(
    error_tx: &mpsc::UnboundedSender<anyhow::Error>,
    control: &StageControl,
    error: anyhow::Error,
) {
    control.fail();
    let _ = error_tx.send(error);
}
