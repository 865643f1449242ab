use itertools::Itertools;

/// Dimensions of a ranked tensor, outermost first. A rank-0 shape describes a
/// single scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dimensions: impl Into<Vec<usize>>) -> Self {
        Self(dimensions.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements. Only meaningful for shapes that passed
    /// [`Shape::checked_element_count`] when they entered the IR
    pub fn element_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Number of elements, or `None` if it does not fit in a `usize`
    pub fn checked_element_count(&self) -> Option<usize> {
        self.0
            .iter()
            .try_fold(1usize, |count, dimension| count.checked_mul(*dimension))
    }

    pub fn reversed(&self) -> Self {
        Self(self.0.iter().rev().copied().collect())
    }

    /// Row-major offset of an index tuple, or `None` if any index is out of
    /// bounds or the arity is wrong
    pub fn linear_offset(&self, indices: &[usize]) -> Option<usize> {
        if indices.len() != self.rank() {
            return None;
        }

        let mut offset = 0;

        for (index, dimension) in indices.iter().zip(&self.0) {
            if index >= dimension {
                return None;
            }

            offset = offset * dimension + index;
        }

        Some(offset)
    }
}

impl core::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.iter().join(", "))
    }
}

/// The type of every tensor value. Element type is always `f64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TensorType {
    /// Shape not known yet. Only legal until shape inference completes
    Unranked,
    Ranked(Shape),
}

impl TensorType {
    pub fn ranked(dimensions: impl Into<Vec<usize>>) -> Self {
        Self::Ranked(Shape::new(dimensions))
    }

    pub fn shape(&self) -> Option<&Shape> {
        match self {
            TensorType::Unranked => None,
            TensorType::Ranked(shape) => Some(shape),
        }
    }

    pub fn is_ranked(&self) -> bool {
        matches!(self, TensorType::Ranked(_))
    }
}

impl core::fmt::Display for TensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorType::Unranked => write!(f, "tensor<*xf64>"),
            TensorType::Ranked(shape) if shape.rank() == 0 => write!(f, "tensor<f64>"),
            TensorType::Ranked(shape) => write!(f, "tensor<{}xf64>", shape.0.iter().join("x")),
        }
    }
}

/// Payload of a constant operation: a row-major block of elements together
/// with its shape
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLiteral {
    shape: Shape,
    values: Vec<f64>,
}

impl DenseLiteral {
    pub fn new(shape: Shape, values: Vec<f64>) -> Self {
        assert_eq!(
            shape.element_count(),
            values.len(),
            "literal values do not fill shape {shape}"
        );

        Self { shape, values }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Same elements viewed through another shape, or `None` when the element
    /// counts differ
    pub fn reshaped(&self, shape: Shape) -> Option<Self> {
        (shape.element_count() == self.values.len()).then(|| Self {
            shape,
            values: self.values.clone(),
        })
    }
}

impl core::fmt::Display for DenseLiteral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_nested(f, self.shape.dimensions(), &self.values, ", ")
    }
}

/// Writes row-major `values` as nested brackets following `dimensions`
pub fn write_nested(
    f: &mut impl core::fmt::Write,
    dimensions: &[usize],
    values: &[f64],
    separator: &str,
) -> std::fmt::Result {
    let Some((&outer, inner)) = dimensions.split_first() else {
        return write!(f, "{}", values.first().copied().unwrap_or_default());
    };

    let stride: usize = inner.iter().product();

    write!(f, "[")?;

    for i in 0..outer {
        if i != 0 {
            write!(f, "{separator}")?;
        }

        write_nested(f, inner, &values[i * stride..(i + 1) * stride], separator)?;
    }

    write!(f, "]")
}
