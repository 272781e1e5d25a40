//! System tray icon with a single Quit item.
//!
//! The tray needs a GTK main loop, so it runs on its own thread for the
//! lifetime of the process. Quitting from the menu goes through the same
//! [`ShutdownHandle`] as the OS signals.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{Context as _, anyhow};
use log::{debug, info, warn};
use tray_icon::menu::{Menu, MenuEvent, MenuId, MenuItem};
use tray_icon::{Icon, TrayIconBuilder};

use crate::alert::ALERT_TITLE;
use crate::assets::ICON_PNG;
use crate::lifecycle::{ShutdownHandle, ShutdownTrigger};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrayCommand {
    Quit,
}

pub struct Tray {
    thread: Option<JoinHandle<()>>,
}

impl Tray {
    /// Builds the tray on a dedicated GTK thread and returns once it is shown.
    pub fn spawn(quit: ShutdownHandle) -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name("tray".to_string())
            .spawn(move || {
                if let Err(err) = gtk::init() {
                    let _ = ready_tx.send(Err(anyhow!("failed to initialize GTK: {}", err)));
                    return;
                }
                // The tray icon is dropped, and hidden, when the main loop ends.
                let _tray = match build(quit) {
                    Ok(tray) => tray,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                gtk::main();
                debug!("Tray main loop finished");
            })
            .context("failed to spawn tray thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("System tray icon created");
                Ok(Tray {
                    thread: Some(thread),
                })
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(anyhow!("tray thread exited during initialization"))
            }
        }
    }

    /// Stops the GTK main loop and removes the icon. Blocks.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        gtk::glib::MainContext::default().invoke(gtk::main_quit);
        if thread.join().is_err() {
            warn!("Tray thread panicked");
        }
    }
}

impl Drop for Tray {
    fn drop(&mut self) {
        self.close();
    }
}

fn build(quit: ShutdownHandle) -> anyhow::Result<tray_icon::TrayIcon> {
    let quit_item = MenuItem::new("Quit", true, None);
    let menu = Menu::new();
    menu.append(&quit_item).context("failed to build tray menu")?;

    let tray = TrayIconBuilder::new()
        .with_menu(Box::new(menu))
        .with_tooltip(ALERT_TITLE)
        .with_icon(load_icon()?)
        .build()
        .context("failed to create tray icon")?;

    let quit_id = quit_item.id().clone();
    MenuEvent::set_event_handler(Some(move |event: MenuEvent| {
        debug!("MenuEvent received: {:?}", event);
        if let Some(command) = command_for(&event.id, &quit_id) {
            apply(command, &quit);
        }
    }));

    Ok(tray)
}

fn load_icon() -> anyhow::Result<Icon> {
    let image = image::load_from_memory(ICON_PNG)
        .context("failed to decode tray icon")?
        .into_rgba8();
    let (width, height) = image.dimensions();
    Icon::from_rgba(image.into_raw(), width, height).context("invalid tray icon")
}

fn command_for(id: &MenuId, quit_id: &MenuId) -> Option<TrayCommand> {
    (id == quit_id).then_some(TrayCommand::Quit)
}

fn apply(command: TrayCommand, quit: &ShutdownHandle) {
    match command {
        TrayCommand::Quit => {
            debug!("Tray: Quit clicked");
            quit.trigger(ShutdownTrigger::Quit);
        }
    }
}
