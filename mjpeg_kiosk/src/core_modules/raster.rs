// THEORY:
// A `Raster` is a screen-sized RGBA pixel buffer. The display keeps two of them:
// the front raster is what the renderer shows, the back raster is where the next
// decoded frame is written. Presenting a frame writes the back raster and then
// swaps the two.
//
// Key architectural principles:
// 1.  **Swap, never copy twice**: The rasters are boxed, so a swap exchanges two
//     pointers. The pixels are written exactly once per frame.
// 2.  **Borrow-enforced exclusion**: `present` takes `&mut self` and returns a
//     shared borrow of the new front. The renderer can look at the front raster
//     only while nothing is writing, and the next write cannot start while the
//     renderer still holds it.
// 3.  **Letterboxing**: A decoded frame that is smaller than the screen is
//     centred on black.

use image::RgbaImage;

const BYTES_PER_PIXEL: usize = 4;
const BLACK: [u8; BYTES_PER_PIXEL] = [0, 0, 0, 255];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    /// Number of the frame drawn into this raster; 0 until one is.
    sequence: u64,
    /// Size of the image last drawn. The black border only needs repainting
    /// when it changes.
    drawn: Option<(u32, u32)>,
}

impl Raster {
    /// A black raster.
    pub fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            pixels: BLACK.repeat(len),
            sequence: 0,
            drawn: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major RGBA bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// RGBA value at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
        let mut out = [0; BYTES_PER_PIXEL];
        out.copy_from_slice(&self.pixels[offset..offset + BYTES_PER_PIXEL]);
        out
    }

    fn draw(&mut self, image: &RgbaImage, sequence: u64) {
        self.sequence = sequence;
        let (image_width, image_height) = image.dimensions();

        if (image_width, image_height) == (self.width, self.height) {
            self.pixels.copy_from_slice(image.as_raw());
            self.drawn = Some((image_width, image_height));
            return;
        }

        if self.drawn != Some((image_width, image_height)) {
            for pixel in self.pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
                pixel.copy_from_slice(&BLACK);
            }
            self.drawn = Some((image_width, image_height));
        }

        let copy_width = image_width.min(self.width);
        let copy_height = image_height.min(self.height);
        let left = ((self.width - copy_width) / 2) as usize;
        let top = ((self.height - copy_height) / 2) as usize;
        let stride = self.stride();
        let row_bytes = copy_width as usize * BYTES_PER_PIXEL;
        let image_stride = image_width as usize * BYTES_PER_PIXEL;
        let source = image.as_raw();

        for row in 0..copy_height as usize {
            let src = row * image_stride;
            let dst = (top + row) * stride + left * BYTES_PER_PIXEL;
            self.pixels[dst..dst + row_bytes].copy_from_slice(&source[src..src + row_bytes]);
        }
    }
}

/// Front and back rasters for flicker-free presentation.
pub struct DoubleBuffer {
    front: Box<Raster>,
    back: Box<Raster>,
    presented: u64,
}

impl DoubleBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            front: Box::new(Raster::new(width, height)),
            back: Box::new(Raster::new(width, height)),
            presented: 0,
        }
    }

    pub fn front(&self) -> &Raster {
        &self.front
    }

    /// Draws `image` into the back raster, swaps, and returns the new front.
    pub fn present(&mut self, image: &RgbaImage) -> &Raster {
        self.presented += 1;
        self.back.draw(image, self.presented);
        std::mem::swap(&mut self.front, &mut self.back);
        &self.front
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}
