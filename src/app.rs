// =============================================================================
// APPLICATION - winit event loop driving a Game and the Renderer
// =============================================================================
//
// FRAME FLOW:
// 1. Measure delta time
// 2. Game::update
// 3. Game::render builds the RenderPacket
// 4. Renderer::draw_frame (wait, acquire, record, submit, present)

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use crate::config::Config;
use crate::renderer::{RenderPacket, Renderer};

/// Game callbacks. Every method has a default so a game only overrides what it needs.
pub trait Game {
    fn name(&self) -> &str {
        "Wyvern"
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, _delta_time: f32) -> Result<()> {
        Ok(())
    }

    fn render(&mut self, delta_time: f32) -> RenderPacket {
        RenderPacket { delta_time }
    }

    fn on_resize(&mut self, _width: u32, _height: u32) {}
}

/// Seconds between consecutive ticks
#[derive(Debug)]
pub struct FrameClock {
    last: Instant,
}

impl FrameClock {
    pub fn new(now: Instant) -> Self {
        Self { last: now }
    }

    pub fn tick(&mut self, now: Instant) -> f32 {
        let delta = now.saturating_duration_since(self.last).as_secs_f32();
        self.last = now;
        delta
    }
}

/// Frames per second, reported once per interval
#[derive(Debug)]
pub struct FpsCounter {
    frames: u32,
    since: Instant,
    interval: Duration,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            since: now,
            interval: Duration::from_secs(1),
        }
    }

    /// Count a rendered frame. Returns the rate once the interval has elapsed.
    pub fn record(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed < self.interval {
            return None;
        }

        let fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.since = now;
        Some(fps)
    }
}

pub struct Application<G: Game> {
    config: Config,
    game: G,
    // Renderer before window: the surface must go first
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    is_minimized: bool,
    clock: FrameClock,
    fps: FpsCounter,
    error: Option<anyhow::Error>,
}

impl<G: Game> Application<G> {
    pub fn new(config: Config, game: G) -> Self {
        let now = Instant::now();
        Self {
            is_fullscreen: config.window.fullscreen,
            config,
            game,
            renderer: None,
            window: None,
            is_minimized: false,
            clock: FrameClock::new(now),
            fps: FpsCounter::new(now),
            error: None,
        }
    }

    /// Run the event loop until the window closes. A fatal error inside the
    /// loop is returned once the loop has exited.
    pub fn run(config: Config, game: G) -> Result<()> {
        let event_loop = EventLoop::new()?;
        let mut app = Self::new(config, game);
        event_loop.run_app(&mut app)?;

        match app.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = Arc::new(event_loop.create_window(window_attributes)?);
        let renderer = Renderer::init(self.game.name(), window.clone(), &self.config)?;
        self.game.initialize()?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        self.clock = FrameClock::new(Instant::now());
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.error = Some(error);
        event_loop.exit();
    }

    fn frame(&mut self) -> Result<()> {
        let now = Instant::now();
        let delta_time = self.clock.tick(now);

        if self.is_minimized {
            return Ok(());
        }

        self.game.update(delta_time)?;
        let packet = self.game.render(delta_time);

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.draw_frame(&packet)?;
        }

        if let Some(fps) = self.fps.record(now) {
            self.show_fps(fps, delta_time);
        }
        Ok(())
    }

    fn show_fps(&self, fps: f32, frame_time: f32) {
        if !self.config.debug.show_fps {
            return;
        }
        if let Some(ref window) = self.window {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title,
                fps,
                frame_time * 1000.0,
                mode
            ));
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows schedules the swapchain rebuild
        }
    }
}

impl<G: Game> ApplicationHandler for Application<G> {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e.context("Failed to initialize"));
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.on_resized(size.width, size.height);
                }
                self.game.on_resize(size.width, size.height);
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.frame() {
                    self.fail(event_loop, e.context("Frame failed"));
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    match event.physical_key {
                        PhysicalKey::Code(KeyCode::Escape) => {
                            log::info!("ESC pressed, exiting...");
                            event_loop.exit();
                        }
                        PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            renderer.shutdown();
        }
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_reports_elapsed_seconds() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start);

        let delta = clock.tick(start + Duration::from_millis(16));
        assert!((delta - 0.016).abs() < 1e-6);

        let delta = clock.tick(start + Duration::from_millis(48));
        assert!((delta - 0.032).abs() < 1e-6);
    }

    #[test]
    fn clock_never_goes_negative() {
        let start = Instant::now();
        let mut clock = FrameClock::new(start + Duration::from_secs(1));
        assert_eq!(clock.tick(start), 0.0);
    }

    #[test]
    fn fps_reported_once_per_second() {
        let start = Instant::now();
        let mut fps = FpsCounter::new(start);

        for i in 1..60 {
            assert_eq!(fps.record(start + Duration::from_millis(i * 16)), None);
        }
        let rate = fps.record(start + Duration::from_secs(1)).unwrap();
        assert!((rate - 60.0).abs() < 1e-3);

        // Counter restarts after reporting
        assert_eq!(fps.record(start + Duration::from_millis(1016)), None);
    }

    struct Noop;
    impl Game for Noop {}

    #[test]
    fn game_defaults_pass_delta_through() {
        let mut game = Noop;
        assert_eq!(game.name(), "Wyvern");
        assert!(game.initialize().is_ok());
        assert!(game.update(0.5).is_ok());
        assert_eq!(game.render(0.25), RenderPacket { delta_time: 0.25 });
    }
}
