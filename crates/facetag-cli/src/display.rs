//! On-screen presentation via a `minifb` window.

use crate::capture_loop::FrameSink;
use anyhow::{Context, Result};
use image::RgbImage;
use minifb::{InputCallback, Key, Window, WindowOptions};
use std::cell::Cell;
use std::rc::Rc;

const QUIT_CHAR: char = 'q';

/// Latches a typed quit character so a tap between updates is not lost.
struct QuitLatch(Rc<Cell<bool>>);

impl InputCallback for QuitLatch {
    fn add_char(&mut self, uni_char: u32) {
        if char::from_u32(uni_char) == Some(QUIT_CHAR) {
            self.0.set(true);
        }
    }
}

/// Window sized to the capture; closed when dropped.
pub struct WindowSink {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
    quit: Rc<Cell<bool>>,
}

impl WindowSink {
    pub fn open(title: &str, width: u32, height: u32) -> Result<Self> {
        let (width, height) = (width as usize, height as usize);
        let mut window = Window::new(title, width, height, WindowOptions::default())
            .with_context(|| format!("opening {width}x{height} window {title:?}"))?;
        let quit = Rc::new(Cell::new(false));
        window.set_input_callback(Box::new(QuitLatch(quit.clone())));
        tracing::info!(title, width, height, "display window opened");
        Ok(Self {
            window,
            buffer: vec![0; width * height],
            width,
            height,
            quit,
        })
    }
}

impl FrameSink for WindowSink {
    fn present(&mut self, frame: &RgbImage) -> Result<()> {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        if (w, h) != (self.width, self.height) {
            self.width = w;
            self.height = h;
            self.buffer.resize(w * h, 0);
        }
        pack_0rgb(frame, &mut self.buffer);
        self.window
            .update_with_buffer(&self.buffer, self.width, self.height)
            .context("updating display window")
    }

    fn quit_requested(&self) -> bool {
        self.quit.get() || !self.window.is_open() || self.window.is_key_down(Key::Q)
    }
}

/// Pack RGB pixels into minifb's 0RGB `u32` layout.
pub fn pack_0rgb(frame: &RgbImage, out: &mut [u32]) {
    for (dst, px) in out.iter_mut().zip(frame.pixels()) {
        let [r, g, b] = px.0;
        *dst = (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b);
    }
}
