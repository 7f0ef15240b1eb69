/// Locally weighted linear fit of `y` on `x` with tricube weights.
///
/// `span` is the fraction of points used for each local fit. Returns the
/// fitted value at every `x`.
pub fn lowess(x: &[f64], y: &[f64], span: f64) -> Vec<f64> {
    let n = x.len().min(y.len());
    if n == 0 {
        return Vec::new();
    }
    if n < 3 {
        let m = y[..n].iter().sum::<f64>() / n as f64;
        return vec![m; n];
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));
    let sx: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let sy: Vec<f64> = order.iter().map(|&i| y[i]).collect();
    let window = ((span * n as f64).ceil() as usize).clamp(3, n);

    let mut fitted = vec![0.0; n];
    let mut lo = 0;
    for i in 0..n {
        // slide the window of nearest neighbours along the sorted x
        while lo + window < n && sx[i] - sx[lo] > sx[lo + window] - sx[i] {
            lo += 1;
        }
        let hi = lo + window;
        let radius = (sx[i] - sx[lo]).max(sx[hi - 1] - sx[i]) * 1.000_001;
        let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for j in lo..hi {
            let w = if radius > 0.0 {
                let d = ((sx[j] - sx[i]) / radius).abs();
                (1.0 - d.powi(3)).max(0.0).powi(3)
            } else {
                1.0
            };
            sw += w;
            swx += w * sx[j];
            swy += w * sy[j];
            swxx += w * sx[j] * sx[j];
            swxy += w * sx[j] * sy[j];
        }
        let denom = sw * swxx - swx * swx;
        fitted[i] = if sw <= 0.0 {
            sy[i]
        } else if denom.abs() < 1e-12 * sw * sw.max(1.0) {
            swy / sw
        } else {
            let slope = (sw * swxy - swx * swy) / denom;
            let intercept = (swy - slope * swx) / sw;
            intercept + slope * sx[i]
        };
    }

    let mut out = vec![0.0; n];
    for (k, &i) in order.iter().enumerate() {
        out[i] = fitted[k];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowess_recovers_line() {
        let x: Vec<f64> = (0..50).map(|i| (i * 7 % 50) as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        for (f, t) in lowess(&x, &y, 0.3).iter().zip(&y) {
            assert!((f - t).abs() < 1e-6, "{f} != {t}");
        }
    }

    #[test]
    fn test_lowess_small_inputs() {
        assert!(lowess(&[], &[], 0.3).is_empty());
        assert_eq!(lowess(&[1.0, 2.0], &[2.0, 4.0], 0.3), vec![3.0, 3.0]);
        let flat = lowess(&[1.0; 5], &[1.0, 2.0, 3.0, 4.0, 5.0], 0.5);
        assert!(flat.iter().all(|v| v.is_finite()));
    }
}
