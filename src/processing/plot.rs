use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::data::FigureData;
use crate::error::{AcquisitionError, Result};
use crate::processing::platform::{CenterOfPressure, ConfidenceEllipse};

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
    /// Caption, axis labels and legend need a system font.
    pub draw_labels: bool,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            background: RGBColor(10, 10, 10),
            palette: vec![BLUE, RED, GREEN, CYAN, MAGENTA, YELLOW, WHITE],
            draw_labels: true,
        }
    }
}

impl PlotStyle {
    fn color(&self, idx: usize) -> RGBColor {
        self.palette
            .get(idx % self.palette.len().max(1))
            .copied()
            .unwrap_or(WHITE)
    }
}

type Area<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

pub fn render_figure_png(figure: &FigureData, style: &PlotStyle) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        match figure {
            FigureData::Series {
                title,
                time_s,
                lines,
            } => draw_time_series(&root, title, time_s, lines, style)?,
            FigureData::Cop {
                title,
                cop,
                ellipse,
            } => draw_cop(&root, title, cop, ellipse.as_ref(), style)?,
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

fn bounds<'a>(values: impl Iterator<Item = &'a f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    if !lo.is_finite() {
        (-1.0, 1.0)
    } else if (hi - lo).abs() < f64::EPSILON {
        (lo - 1.0, hi + 1.0)
    } else {
        (lo, hi)
    }
}

fn draw_time_series(
    root: &Area<'_>,
    title: &str,
    time_s: &[f64],
    lines: &[(String, Vec<f64>)],
    style: &PlotStyle,
) -> Result<()> {
    if lines.is_empty() || time_s.is_empty() {
        return Err(AcquisitionError::Plot(format!("{title}: nothing to plot")));
    }
    let (x0, x1) = bounds(time_s.iter());
    let (y0, y1) = bounds(lines.iter().flat_map(|(_, v)| v.iter()));
    let mut builder = ChartBuilder::on(root);
    builder.margin(10);
    if style.draw_labels {
        builder
            .caption(title, ("sans-serif", 20).into_font().color(&WHITE))
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 40);
    }
    let mut chart = builder.build_cartesian_2d(x0..x1, y0..y1)?;
    if style.draw_labels {
        chart
            .configure_mesh()
            .light_line_style(&WHITE.mix(0.1))
            .draw()?;
    }
    for (idx, (label, values)) in lines.iter().enumerate() {
        let color = style.color(idx);
        let points = time_s
            .iter()
            .zip(values)
            .filter(|(t, v)| t.is_finite() && v.is_finite())
            .map(|(t, v)| (*t, *v));
        let series = chart.draw_series(LineSeries::new(points, &color))?;
        if style.draw_labels {
            series
                .label(label.as_str())
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
    }
    if style.draw_labels {
        chart
            .configure_series_labels()
            .border_style(&WHITE.mix(0.2))
            .background_style(&style.background)
            .draw()?;
    }
    Ok(())
}

fn draw_cop(
    root: &Area<'_>,
    title: &str,
    cop: &CenterOfPressure,
    ellipse: Option<&ConfidenceEllipse>,
    style: &PlotStyle,
) -> Result<()> {
    if cop.x.is_empty() {
        return Err(AcquisitionError::Plot(format!("{title}: empty COP")));
    }
    let boundary = ellipse.map(|e| e.boundary.as_slice()).unwrap_or(&[]);
    let (x0, x1) = bounds(cop.x.iter().chain(boundary.iter().map(|(x, _)| x)));
    let (y0, y1) = bounds(cop.y.iter().chain(boundary.iter().map(|(_, y)| y)));
    let mut builder = ChartBuilder::on(root);
    builder.margin(10);
    if style.draw_labels {
        builder
            .caption(title, ("sans-serif", 20).into_font().color(&WHITE))
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 40);
    }
    let mut chart = builder.build_cartesian_2d(x0..x1, y0..y1)?;
    if style.draw_labels {
        chart
            .configure_mesh()
            .x_desc("COP x (mm)")
            .y_desc("COP y (mm)")
            .light_line_style(&WHITE.mix(0.1))
            .draw()?;
    }
    let path_color = style.color(0);
    chart.draw_series(LineSeries::new(
        cop.x
            .iter()
            .zip(&cop.y)
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(x, y)| (*x, *y)),
        &path_color,
    ))?;
    if !boundary.is_empty() {
        let ellipse_color = style.color(1);
        chart.draw_series(LineSeries::new(boundary.iter().copied(), &ellipse_color))?;
    }
    Ok(())
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| AcquisitionError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::platform::confidence_ellipse;

    const PNG_MAGIC: [u8; 4] = [0x89, b'P', b'N', b'G'];

    fn quiet_style() -> PlotStyle {
        PlotStyle {
            width: 200,
            height: 100,
            draw_labels: false,
            ..Default::default()
        }
    }

    #[test]
    fn time_series_renders_png() {
        let figure = FigureData::Series {
            title: "lc".into(),
            time_s: vec![0.0, 0.01, 0.02],
            lines: vec![("lc".into(), vec![1.0, f64::NAN, 3.0])],
        };
        let png = render_figure_png(&figure, &quiet_style()).unwrap();
        assert_eq!(png[..4], PNG_MAGIC);
    }

    #[test]
    fn cop_renders_with_ellipse() {
        let cop = CenterOfPressure {
            x: vec![1.0, -1.0, 0.0, 0.0],
            y: vec![0.0, 0.0, 2.0, -2.0],
        };
        let ellipse = confidence_ellipse(&cop);
        let figure = FigureData::Cop {
            title: "plate".into(),
            cop,
            ellipse,
        };
        let png = render_figure_png(&figure, &quiet_style()).unwrap();
        assert_eq!(png[..4], PNG_MAGIC);
    }

    #[test]
    fn empty_series_is_an_error() {
        let figure = FigureData::Series {
            title: "empty".into(),
            time_s: vec![],
            lines: vec![],
        };
        assert!(render_figure_png(&figure, &quiet_style()).is_err());
    }
}
