use std::io::Cursor;
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context as _, anyhow};
use log::{debug, warn};
use rodio::{Decoder, OutputStream, Sink};

use crate::alert::AudioCue;
use crate::assets::DOORBELL_WAV;

type Cue = Decoder<Cursor<&'static [u8]>>;

/// Owns the audio output device. The device lives on its own thread because
/// the output stream can't move between threads; cues are handed over a
/// channel so playing never blocks the caller.
pub struct Speaker {
    tx: Mutex<Option<Sender<Cue>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Speaker {
    /// Opens the default output device, failing if none is available.
    pub fn open() -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<Cue>();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name("speaker".to_string())
            .spawn(move || playback_loop(rx, ready_tx))
            .context("failed to spawn audio thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Speaker {
                tx: Mutex::new(Some(tx)),
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(anyhow!("failed to initialize speaker: {}", reason))
            }
            Err(_) => {
                let _ = thread.join();
                Err(anyhow!("audio thread exited during initialization"))
            }
        }
    }

    /// Stops accepting cues, lets anything already playing finish and then
    /// releases the device. Blocks; only the first call does any work.
    pub fn close(&self) {
        // A poisoned lock still holds the sender; it must be dropped or the
        // join below never returns.
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(tx);

        let thread = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(thread) = thread {
            debug!("Waiting for audio playback to finish");
            if thread.join().is_err() {
                warn!("Audio thread panicked");
            }
        }
    }
}

impl AudioCue for Speaker {
    fn play(&self) -> anyhow::Result<()> {
        let cue = Decoder::new(Cursor::new(DOORBELL_WAV)).context("failed to decode doorbell sound")?;

        let guard = self
            .tx
            .lock()
            .map_err(|_| anyhow!("speaker state poisoned"))?;
        let tx = guard.as_ref().ok_or_else(|| anyhow!("speaker is closed"))?;
        tx.send(cue).map_err(|_| anyhow!("audio thread is gone"))
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.close();
    }
}

fn playback_loop(rx: Receiver<Cue>, ready: mpsc::SyncSender<Result<(), String>>) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(output) => output,
        Err(err) => {
            let _ = ready.send(Err(err.to_string()));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut active_sinks: Vec<Sink> = Vec::new();
    while let Ok(cue) = rx.recv() {
        active_sinks.retain(|sink| !sink.empty());

        match Sink::try_new(&handle) {
            Ok(sink) => {
                sink.append(cue);
                active_sinks.push(sink);
            }
            Err(err) => warn!("Failed to create audio sink: {}", err),
        }
    }

    for sink in active_sinks {
        sink.sleep_until_end();
    }
    debug!("Audio device released");
}
