use sdl2::pixels::Color;
use sdl2::rect::Rect;
use sdl2::render::Canvas;
use sdl2::video::Window;

use chip8_vm::chip8::Framebuffer;

/// Physical pixels per CHIP-8 logical pixel. At the default scale the window
/// is 640x320.
const SCALE_FACTOR: u32 = 10;

/// The SDL2 window/render backend. This is the one concrete "render target"
/// the core's `Framebuffer::render` is agnostic about — it only knows how to
/// call a `paint_pixel(x, y)` closure in logical coordinates.
pub struct Display {
    canvas: Canvas<Window>,
}

impl Display {
    pub fn new(sdl_context: &sdl2::Sdl) -> Self {
        let video_subsys = sdl_context.video().unwrap();
        let window = video_subsys
            .window(
                "CHIP-8 VM",
                Framebuffer::COLUMNS as u32 * SCALE_FACTOR,
                Framebuffer::LINES as u32 * SCALE_FACTOR,
            )
            .position_centered()
            .opengl()
            .build()
            .unwrap();

        let mut canvas = window.into_canvas().build().unwrap();
        canvas.set_draw_color(Color::RGB(0, 0, 0));
        canvas.clear();
        canvas.present();

        Display { canvas }
    }

    /// Repaints the window from `framebuffer` if it is dirty (or `force`):
    /// clear to black, then fill a scaled white rectangle for every set pixel.
    pub fn draw(&mut self, framebuffer: &Framebuffer, force: bool) {
        if !framebuffer.is_dirty() && !force {
            return;
        }

        let canvas = &mut self.canvas;
        canvas.set_draw_color(Color::RGB(0, 0, 0));
        canvas.clear();
        canvas.set_draw_color(Color::RGB(255, 255, 255));

        framebuffer.render(true, |x, y| {
            let rect = Rect::new(
                (x as u32 * SCALE_FACTOR) as i32,
                (y as u32 * SCALE_FACTOR) as i32,
                SCALE_FACTOR,
                SCALE_FACTOR,
            );
            let _ = canvas.fill_rect(rect);
        });

        canvas.present();
    }
}
